//! Operator alerts.
//!
//! Emitted as structured JSON log lines on the `risk_alert` target so the log
//! pipeline can pick them up without parsing free text.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

/// Conditions the operator must hear about.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum AlertKind {
    /// Market data older than the warning threshold
    StaleData { instrument: String, age_hours: i64 },
    /// Market data older than the halt threshold; instrument excluded
    CriticalStaleData { instrument: String, age_hours: i64 },
    /// Cycle stopped before any order was placed
    CycleHalted { reason: String },
    /// Trade intent gave up on an unrecoverable exchange error
    IntentAbandoned { instrument: String, reason: String },
    /// Strategy adapter failed; treated as empty for the cycle
    StrategyFailed { strategy: String, error: String },
}

/// Severity levels for alerts.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Info => "INFO",
            AlertSeverity::Warning => "WARNING",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub timestamp: DateTime<Utc>,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        let timestamp = Utc::now();
        Self {
            alert_id: format!("alert-{}-{:08x}", timestamp.timestamp(), timestamp.timestamp_subsec_nanos()),
            timestamp,
            kind,
            severity,
            message: message.into(),
        }
    }

    pub fn stale_data(instrument: &str, age_hours: i64) -> Self {
        Self::new(
            AlertKind::StaleData {
                instrument: instrument.to_string(),
                age_hours,
            },
            AlertSeverity::Warning,
            format!("{} candles are {}h old, trading on stale data", instrument, age_hours),
        )
    }

    pub fn critical_stale_data(instrument: &str, age_hours: i64) -> Self {
        Self::new(
            AlertKind::CriticalStaleData {
                instrument: instrument.to_string(),
                age_hours,
            },
            AlertSeverity::Critical,
            format!("{} candles are {}h old, excluded from this cycle", instrument, age_hours),
        )
    }

    pub fn cycle_halted(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            AlertKind::CycleHalted {
                reason: reason.clone(),
            },
            AlertSeverity::Critical,
            format!("Trading halted: {}", reason),
        )
    }

    pub fn intent_abandoned(instrument: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            AlertKind::IntentAbandoned {
                instrument: instrument.to_string(),
                reason: reason.clone(),
            },
            AlertSeverity::Error,
            format!("Trade for {} abandoned: {}", instrument, reason),
        )
    }

    pub fn strategy_failed(strategy: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self::new(
            AlertKind::StrategyFailed {
                strategy: strategy.to_string(),
                error: error.clone(),
            },
            AlertSeverity::Error,
            format!("Strategy {} failed and is treated as empty: {}", strategy, error),
        )
    }

    /// Emit alert as structured log.
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();

        match self.severity {
            AlertSeverity::Info => info!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Warning => warn!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Error => error!(target: "risk_alert", "RISK_ALERT: {}", json),
            AlertSeverity::Critical => error!(target: "risk_alert", "RISK_ALERT: {}", json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_serializes_with_type_tag() {
        let alert = Alert::intent_abandoned("ETH", "insufficient margin");
        let json = serde_json::to_value(&alert).unwrap();

        assert_eq!(json["kind"]["type"], "IntentAbandoned");
        assert_eq!(json["kind"]["instrument"], "ETH");
        assert_eq!(json["severity"], "Error");
        assert!(alert.alert_id.starts_with("alert-"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(AlertSeverity::Critical > AlertSeverity::Error);
        assert!(AlertSeverity::Warning > AlertSeverity::Info);
        assert_eq!(Alert::cycle_halted("all data stale").severity.as_str(), "CRITICAL");
    }
}
