//! Risk-parity position sizing.
//!
//! Selected instruments are weighted by inverse trailing volatility so that
//! each contributes a similar amount of risk. The long book is normalised to
//! `long_fraction` and the short book to `short_fraction`.

use super::registry::{Signal, Weights};
use crate::config::{SizingConfig, SizingMode};
use crate::market::{DataError, MarketData};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{debug, warn};

/// Sized weights plus the instruments that could not be sized.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SizingResult {
    pub weights: Weights,
    pub dropped: Vec<DataError>,
}

impl SizingResult {
    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PositionSizer {
    lookback: usize,
    min_data_points: usize,
    long_fraction: Decimal,
    short_fraction: Decimal,
}

impl PositionSizer {
    pub fn new(config: &SizingConfig) -> Self {
        Self {
            lookback: config.lookback_days,
            min_data_points: config.min_data_points.max(2),
            long_fraction: config.long_fraction,
            short_fraction: config.short_fraction,
        }
    }

    /// Size a signal according to the strategy's sizing mode.
    pub fn apply(&self, mode: SizingMode, signal: &Signal, data: &MarketData) -> SizingResult {
        match mode {
            SizingMode::RiskParity => self.size(signal, data),
            SizingMode::AsIs => SizingResult {
                weights: Self::as_is(signal),
                dropped: Vec::new(),
            },
        }
    }

    /// Inverse-volatility weights for the instruments selected by `signal`.
    ///
    /// The sign of each signal entry picks the side; its magnitude is ignored.
    /// Instruments without enough history or with zero volatility are dropped.
    /// A side with no survivors leaves its fraction uninvested.
    pub fn size(&self, signal: &Signal, data: &MarketData) -> SizingResult {
        let mut dropped = Vec::new();
        let longs = self.inverse_vols(&signal.longs(), data, &mut dropped);
        let shorts = self.inverse_vols(&signal.shorts(), data, &mut dropped);

        let mut weights = Weights::new();
        Self::normalise_into(&mut weights, &longs, self.long_fraction);
        Self::normalise_into(&mut weights, &shorts, -self.short_fraction);

        if weights.is_empty() && !signal.is_empty() {
            debug!(dropped = dropped.len(), "No instrument survived sizing");
        }

        SizingResult { weights, dropped }
    }

    /// Pass-through sizing, scaled down so gross weight never exceeds 1.
    pub fn as_is(signal: &Signal) -> Weights {
        let gross: Decimal = signal.iter().map(|(_, w)| w.abs()).sum();
        let scale = if gross > Decimal::ONE {
            Decimal::ONE / gross
        } else {
            Decimal::ONE
        };
        signal
            .iter()
            .filter(|(_, w)| !w.is_zero())
            .map(|(k, w)| (k.clone(), *w * scale))
            .collect()
    }

    /// Trailing realised volatility (sample standard deviation of returns).
    pub fn volatility(&self, instrument: &str, data: &MarketData) -> Result<Decimal, DataError> {
        let returns = data.returns(instrument, self.lookback)?;
        if returns.len() < self.min_data_points {
            return Err(DataError::InsufficientData {
                instrument: instrument.to_string(),
                available: returns.len(),
                required: self.min_data_points,
            });
        }

        let values: Vec<f64> = returns.iter().filter_map(|r| r.to_f64()).collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);

        Ok(Decimal::from_f64(variance.sqrt()).unwrap_or(Decimal::ZERO))
    }

    fn inverse_vols(
        &self,
        instruments: &[&str],
        data: &MarketData,
        dropped: &mut Vec<DataError>,
    ) -> Vec<(String, Decimal)> {
        instruments
            .iter()
            .filter_map(|instrument| match self.volatility(instrument, data) {
                Ok(vol) if vol > Decimal::ZERO => Some((instrument.to_string(), Decimal::ONE / vol)),
                Ok(_) => {
                    warn!(%instrument, "Zero volatility, dropping from selection");
                    dropped.push(DataError::InsufficientData {
                        instrument: instrument.to_string(),
                        available: 0,
                        required: self.min_data_points,
                    });
                    None
                }
                Err(e) => {
                    warn!(%instrument, error = %e, "Dropping instrument from selection");
                    dropped.push(e);
                    None
                }
            })
            .collect()
    }

    fn normalise_into(weights: &mut Weights, inverse_vols: &[(String, Decimal)], fraction: Decimal) {
        let total: Decimal = inverse_vols.iter().map(|(_, iv)| *iv).sum();
        if total <= Decimal::ZERO {
            return;
        }
        for (instrument, iv) in inverse_vols {
            weights.insert(instrument.clone(), fraction * *iv / total);
        }
    }
}
