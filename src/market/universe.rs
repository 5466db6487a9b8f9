//! Tradable instrument universe: research names mapped to venue symbols.

use crate::config::{Config, InstrumentConfig};
use rust_decimal::Decimal;
use std::collections::BTreeMap;

/// Venue details for one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentSpec {
    pub instrument: String,
    pub exchange_symbol: String,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct Universe {
    by_instrument: BTreeMap<String, InstrumentSpec>,
}

impl Universe {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.universe,
            &config.portfolio.quote_asset,
            config.execution.default_tick_size,
            config.execution.default_lot_size,
        )
    }

    pub fn new(
        instruments: &[InstrumentConfig],
        quote_asset: &str,
        default_tick: Decimal,
        default_lot: Decimal,
    ) -> Self {
        let by_instrument = instruments
            .iter()
            .map(|ic| {
                let spec = InstrumentSpec {
                    instrument: ic.instrument.clone(),
                    exchange_symbol: ic
                        .exchange_symbol
                        .clone()
                        .unwrap_or_else(|| format!("{}{}", ic.instrument, quote_asset)),
                    tick_size: ic.tick_size.unwrap_or(default_tick),
                    lot_size: ic.lot_size.unwrap_or(default_lot),
                };
                (ic.instrument.clone(), spec)
            })
            .collect();
        Self { by_instrument }
    }

    pub fn get(&self, instrument: &str) -> Option<&InstrumentSpec> {
        self.by_instrument.get(instrument)
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.by_instrument.contains_key(instrument)
    }

    /// Reverse lookup from a venue symbol.
    pub fn instrument_for_symbol(&self, symbol: &str) -> Option<&str> {
        self.by_instrument
            .values()
            .find(|spec| spec.exchange_symbol == symbol)
            .map(|spec| spec.instrument.as_str())
    }

    pub fn instruments(&self) -> impl Iterator<Item = &InstrumentSpec> {
        self.by_instrument.values()
    }

    pub fn len(&self) -> usize {
        self.by_instrument.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_instrument.is_empty()
    }
}
