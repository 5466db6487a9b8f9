//! Exchange capability and the venues shipped with the rebalancer.
//!
//! ## Venues
//! - `PaperExchange`: simulated top of book and fills, persisted between runs
//! - `DryRunExchange`: wraps any venue, reads pass through, writes are logged
//!
//! Every call is wrapped with [`retry::with_retry`] by the execution engine.

mod dry_run;
mod error;
pub mod paper;
pub mod retry;
mod traits;
mod types;

pub use dry_run::DryRunExchange;
pub use error::{ExchangeError, ExchangeResult};
pub use paper::{PaperExchange, PaperPosition, PaperSnapshot};
pub use retry::{with_retry, RetryPolicy};
#[cfg(test)]
pub use traits::MockExchange;
pub use traits::Exchange;
pub use types::*;
