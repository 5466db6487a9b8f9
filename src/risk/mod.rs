//! Risk controls around a rebalance cycle.
//!
//! - Market data freshness (warn / exclude / halt)
//! - Structured operator alerts

mod alerts;
mod staleness;

pub use alerts::{Alert, AlertKind, AlertSeverity};
pub use staleness::{Freshness, FreshnessGuard, StalenessReport};
