//! Market data and instrument universe.

mod data;
mod universe;

pub use data::{Candle, CsvCandleLoader, DataError, MarketData, MarketDataSource};
pub use universe::{InstrumentSpec, Universe};
