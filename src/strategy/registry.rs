//! Strategy adapters and the name -> adapter registry.
//!
//! An adapter is a pure function of market history, its notional budget and
//! its free-form parameters. Adding a strategy means registering another
//! adapter under a new name.

use crate::market::MarketData;
use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Instrument -> signed weight, ordered by instrument.
pub type Weights = BTreeMap<String, Decimal>;

/// Adapter parameters as given in configuration.
pub type StrategyParams = HashMap<String, serde_json::Value>;

/// A strategy's raw directional view: instrument -> signed weight in [-1, 1].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signal(Weights);

impl Signal {
    /// Build a signal, clamping every weight into [-1, 1].
    pub fn new<I, S>(weights: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        Self(
            weights
                .into_iter()
                .map(|(k, v)| (k.into(), v.clamp(Decimal::NEGATIVE_ONE, Decimal::ONE)))
                .collect(),
        )
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// True when no instrument carries a non-zero weight.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(|w| w.is_zero())
    }

    pub fn get(&self, instrument: &str) -> Option<Decimal> {
        self.0.get(instrument).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Decimal)> {
        self.0.iter()
    }

    pub fn weights(&self) -> &Weights {
        &self.0
    }

    /// Instruments selected long, sorted.
    pub fn longs(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, w)| **w > Decimal::ZERO)
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Instruments selected short, sorted.
    pub fn shorts(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, w)| **w < Decimal::ZERO)
            .map(|(k, _)| k.as_str())
            .collect()
    }
}

/// A pluggable strategy.
pub trait StrategyAdapter: Send + Sync {
    /// Compute today's signal from `data` for a notional budget of `capital`.
    fn compute(&self, data: &MarketData, capital: Decimal, params: &StrategyParams) -> Result<Signal>;
}

/// Name -> adapter lookup.
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    adapters: HashMap<String, Arc<dyn StrategyAdapter>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the adapters shipped in this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("momentum", Arc::new(MomentumAdapter));
        registry.register("static_weights", Arc::new(StaticWeightsAdapter));
        registry
    }

    pub fn register(&mut self, name: &str, adapter: Arc<dyn StrategyAdapter>) {
        debug!(adapter = name, "Registered strategy adapter");
        self.adapters.insert(name.to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StrategyAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

fn param_usize(params: &StrategyParams, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value
            .as_u64()
            .map(|v| v as usize)
            .with_context(|| format!("parameter {} must be a non-negative integer, got {}", key, value)),
    }
}

fn param_str<'a>(params: &'a StrategyParams, key: &str) -> Result<Option<&'a str>> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .with_context(|| format!("parameter {} must be a string, got {}", key, value)),
    }
}

fn value_to_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Cross-sectional momentum.
///
/// Ranks instruments by trailing return over `lookback_days` and goes long the
/// `top_n` best and short the `bottom_n` worst. With `regime_instrument` set,
/// the whole book goes flat whenever that instrument closes below its
/// `regime_sma_days` simple moving average.
///
/// Parameters: `lookback_days` (30), `top_n` (3), `bottom_n` (0),
/// `regime_instrument` (none), `regime_sma_days` (50).
pub struct MomentumAdapter;

impl MomentumAdapter {
    fn risk_off(data: &MarketData, instrument: &str, sma_days: usize) -> Result<bool> {
        let closes = data.closes(instrument);
        if sma_days == 0 || closes.len() < sma_days {
            bail!(
                "regime filter needs {} closes of {}, have {}",
                sma_days,
                instrument,
                closes.len()
            );
        }
        let window = &closes[closes.len() - sma_days..];
        let sma = window.iter().sum::<Decimal>() / Decimal::from(sma_days);
        let last = closes[closes.len() - 1];
        Ok(last < sma)
    }
}

impl StrategyAdapter for MomentumAdapter {
    fn compute(&self, data: &MarketData, _capital: Decimal, params: &StrategyParams) -> Result<Signal> {
        let lookback = param_usize(params, "lookback_days", 30)?;
        let top_n = param_usize(params, "top_n", 3)?;
        let bottom_n = param_usize(params, "bottom_n", 0)?;
        if lookback == 0 {
            bail!("lookback_days must be positive");
        }

        if let Some(regime) = param_str(params, "regime_instrument")? {
            let sma_days = param_usize(params, "regime_sma_days", 50)?;
            if Self::risk_off(data, regime, sma_days)? {
                debug!(regime, sma_days, "Momentum regime filter is risk-off");
                return Ok(Signal::empty());
            }
        }

        let mut scores: Vec<(String, Decimal)> = data
            .instruments()
            .into_iter()
            .filter_map(|instrument| {
                let closes = data.closes(&instrument);
                if closes.len() <= lookback {
                    return None;
                }
                let past = closes[closes.len() - 1 - lookback];
                let last = closes[closes.len() - 1];
                if past <= Decimal::ZERO {
                    return None;
                }
                Some((instrument, last / past - Decimal::ONE))
            })
            .collect();

        // Best first; instrument name breaks ties
        scores.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let top_n = top_n.min(scores.len());
        let bottom_n = bottom_n.min(scores.len() - top_n);

        let mut weights = Weights::new();
        if top_n > 0 {
            let w = Decimal::ONE / Decimal::from(top_n);
            for (instrument, _) in scores.iter().take(top_n) {
                weights.insert(instrument.clone(), w);
            }
        }
        if bottom_n > 0 {
            let w = Decimal::NEGATIVE_ONE / Decimal::from(bottom_n);
            for (instrument, _) in scores.iter().rev().take(bottom_n) {
                weights.insert(instrument.clone(), w);
            }
        }

        Ok(Signal::new(weights))
    }
}

/// Fixed weights from configuration, e.g. `weights = { BTC = 0.5, ETH = -0.5 }`.
///
/// Instruments without market data are left out.
pub struct StaticWeightsAdapter;

impl StrategyAdapter for StaticWeightsAdapter {
    fn compute(&self, data: &MarketData, _capital: Decimal, params: &StrategyParams) -> Result<Signal> {
        let Some(raw) = params.get("weights") else {
            return Ok(Signal::empty());
        };
        let map = raw
            .as_object()
            .with_context(|| format!("parameter weights must be a table, got {}", raw))?;

        // Configuration layers may fold key case
        let available = data.instruments();
        let mut weights = Weights::new();
        for (key, value) in map {
            let weight = value_to_decimal(value)
                .with_context(|| format!("weight for {} is not a number: {}", key, value))?;
            if let Some(instrument) = available.iter().find(|i| i.eq_ignore_ascii_case(key)) {
                weights.insert(instrument.clone(), weight);
            }
        }
        Ok(Signal::new(weights))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::Candle;
    use chrono::{Duration, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn series(instrument: &str, closes: &[Decimal]) -> Vec<(String, Candle)> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| {
                (
                    instrument.to_string(),
                    Candle {
                        timestamp: start + Duration::days(i as i64),
                        open: *close,
                        high: *close,
                        low: *close,
                        close: *close,
                        volume: dec!(1),
                    },
                )
            })
            .collect()
    }

    fn market() -> MarketData {
        let mut candles = series("BTC", &[dec!(100), dec!(110), dec!(120)]);
        candles.extend(series("ETH", &[dec!(100), dec!(95), dec!(90)]));
        candles.extend(series("SOL", &[dec!(100), dec!(105), dec!(104)]));
        MarketData::from_candles(candles)
    }

    fn params(value: serde_json::Value) -> StrategyParams {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_signal_clamps_weights() {
        let signal = Signal::new([("BTC", dec!(2)), ("ETH", dec!(-3)), ("SOL", dec!(0))]);
        assert_eq!(signal.get("BTC"), Some(dec!(1)));
        assert_eq!(signal.get("ETH"), Some(dec!(-1)));
        assert_eq!(signal.longs(), vec!["BTC"]);
        assert_eq!(signal.shorts(), vec!["ETH"]);
        assert!(!signal.is_empty());
        assert!(Signal::new([("SOL", dec!(0))]).is_empty());
    }

    #[test]
    fn test_momentum_ranks_long_and_short() {
        let signal = MomentumAdapter
            .compute(
                &market(),
                dec!(1000),
                &params(json!({"lookback_days": 2, "top_n": 1, "bottom_n": 1})),
            )
            .unwrap();

        assert_eq!(signal.get("BTC"), Some(dec!(1)));
        assert_eq!(signal.get("ETH"), Some(dec!(-1)));
        assert_eq!(signal.get("SOL"), None);
    }

    #[test]
    fn test_momentum_skips_short_history() {
        let signal = MomentumAdapter
            .compute(&market(), dec!(1000), &params(json!({"lookback_days": 5})))
            .unwrap();
        assert!(signal.is_empty());
    }

    #[test]
    fn test_momentum_regime_filter_goes_flat() {
        // ETH is below its 3-day average
        let signal = MomentumAdapter
            .compute(
                &market(),
                dec!(1000),
                &params(json!({
                    "lookback_days": 2,
                    "regime_instrument": "ETH",
                    "regime_sma_days": 3
                })),
            )
            .unwrap();
        assert!(signal.is_empty());
    }

    #[test]
    fn test_static_weights_filters_missing_instruments() {
        let signal = StaticWeightsAdapter
            .compute(
                &market(),
                dec!(1000),
                &params(json!({"weights": {"BTC": 0.5, "ETH": "-0.5", "DOGE": 1, "sol": 0.25}})),
            )
            .unwrap();

        assert_eq!(signal.get("BTC"), Some(dec!(0.5)));
        assert_eq!(signal.get("ETH"), Some(dec!(-0.5)));
        assert_eq!(signal.get("DOGE"), None);
        assert_eq!(signal.get("SOL"), Some(dec!(0.25)));
    }

    #[test]
    fn test_bad_parameter_is_an_error() {
        let result = MomentumAdapter.compute(&market(), dec!(1000), &params(json!({"top_n": "three"})));
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = StrategyRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["momentum", "static_weights"]);
        assert!(registry.get("momentum").is_some());
        assert!(registry.get("carry").is_none());
    }
}
