//! Market data freshness checks.
//!
//! Each instrument is judged by its newest candle. Between the warning and
//! halt thresholds the cycle trades with a loud warning; past the halt
//! threshold the instrument is removed from the cycle, and when nothing fresh
//! enough is left the whole cycle halts.

use super::alerts::Alert;
use crate::config::DataConfig;
use crate::market::{DataError, MarketData};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Warn { age_hours: i64 },
    Critical { age_hours: i64 },
}

/// Outcome of checking a whole data set.
#[derive(Debug, Clone, Default)]
pub struct StalenessReport {
    /// Instruments usable this cycle (fresh or warned)
    pub usable: Vec<String>,
    /// Instruments past the warning threshold but still tradable
    pub warned: Vec<DataError>,
    /// Instruments past the halt threshold, excluded from the cycle
    pub excluded: Vec<DataError>,
    pub alerts: Vec<Alert>,
}

impl StalenessReport {
    /// Nothing usable remains.
    pub fn should_halt(&self) -> bool {
        self.usable.is_empty()
    }

    pub fn excluded_instruments(&self) -> Vec<String> {
        self.excluded
            .iter()
            .filter_map(|e| match e {
                DataError::Stale { instrument, .. } => Some(instrument.clone()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct FreshnessGuard {
    warn_after: Duration,
    halt_after: Duration,
}

impl FreshnessGuard {
    pub fn new(config: &DataConfig) -> Self {
        Self {
            warn_after: Duration::hours(config.warn_after_hours as i64),
            halt_after: Duration::hours(config.halt_after_hours as i64),
        }
    }

    pub fn classify(&self, last: DateTime<Utc>, now: DateTime<Utc>) -> Freshness {
        let age = now - last;
        let age_hours = age.num_hours();
        if age > self.halt_after {
            Freshness::Critical { age_hours }
        } else if age > self.warn_after {
            Freshness::Warn { age_hours }
        } else {
            Freshness::Fresh
        }
    }

    /// Classify every instrument in `data` as of `now`.
    pub fn check(&self, data: &MarketData, now: DateTime<Utc>) -> StalenessReport {
        let mut report = StalenessReport::default();

        for instrument in data.instruments() {
            let Some(last) = data.last_timestamp(&instrument) else {
                continue;
            };
            match self.classify(last, now) {
                Freshness::Fresh => {
                    debug!(%instrument, %last, "Data fresh");
                    report.usable.push(instrument);
                }
                Freshness::Warn { age_hours } => {
                    warn!(%instrument, age_hours, "⚠️ [DATA] Stale data, proceeding");
                    report.alerts.push(Alert::stale_data(&instrument, age_hours));
                    report.warned.push(DataError::Stale {
                        instrument: instrument.clone(),
                        age_hours,
                    });
                    report.usable.push(instrument);
                }
                Freshness::Critical { age_hours } => {
                    warn!(%instrument, age_hours, "🛑 [DATA] Critically stale data, excluding");
                    report.alerts.push(Alert::critical_stale_data(&instrument, age_hours));
                    report.excluded.push(DataError::Stale {
                        instrument,
                        age_hours,
                    });
                }
            }
        }

        report
    }
}
