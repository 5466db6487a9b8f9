//! Exchange error taxonomy.

use super::types::OrderId;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for exchange call results.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Error returned by any exchange call.
///
/// Transient variants are retried with backoff; everything else abandons the
/// affected trade intent without retrying.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid instrument: {0}")]
    InvalidInstrument(String),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("insufficient margin: {0}")]
    InsufficientMargin(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown order {0}")]
    UnknownOrder(OrderId),
}

impl ExchangeError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout(_)
            | ExchangeError::RateLimited(_)
            | ExchangeError::Transport(_) => true,
            ExchangeError::Server { status, .. } => *status >= 500,
            ExchangeError::InvalidInstrument(_)
            | ExchangeError::Authentication(_)
            | ExchangeError::InsufficientMargin(_)
            | ExchangeError::Rejected(_)
            | ExchangeError::UnknownOrder(_) => false,
        }
    }
}
