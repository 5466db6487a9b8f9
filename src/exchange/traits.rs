//! Venue-agnostic exchange capability.
//!
//! The engine only needs a handful of operations from a venue: read positions
//! and equity, read the top of book, and submit / cancel / poll / look up
//! orders. Any venue
//! (live, paper, dry-run wrapper) plugs in by implementing [`Exchange`].

use super::error::ExchangeResult;
use super::types::{BookTop, NewOrder, OrderAck, OrderId, OrderState, Position};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// Trait implemented by every execution venue.
///
/// All calls are network RPCs from the engine's point of view: callers wrap
/// them with a timeout and the retry policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Exchange: Send + Sync {
    /// Short venue name for logs.
    fn name(&self) -> &str;

    /// All non-zero positions.
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>>;

    /// Total account equity in USD (cash + marked positions).
    async fn get_account_equity(&self) -> ExchangeResult<Decimal>;

    /// Best bid/ask for a venue symbol.
    async fn get_order_book(&self, symbol: &str) -> ExchangeResult<BookTop>;

    /// Submit a new order.
    async fn submit_order(&self, order: &NewOrder) -> ExchangeResult<OrderAck>;

    /// Cancel an order. Cancelling an order that is already done is not an error.
    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> ExchangeResult<()>;

    /// Current state of an order.
    async fn get_order_status(&self, symbol: &str, order_id: OrderId)
        -> ExchangeResult<OrderState>;

    /// Order submitted with `client_order_id`, if the venue has one.
    ///
    /// Used after a submit whose outcome is unknown (timeout, dropped
    /// connection) to tell "never arrived" from "accepted but unanswered".
    async fn find_order(&self, symbol: &str, client_order_id: &str)
        -> ExchangeResult<Option<OrderState>>;
}

#[async_trait]
impl<T: Exchange + ?Sized> Exchange for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        (**self).get_positions().await
    }

    async fn get_account_equity(&self) -> ExchangeResult<Decimal> {
        (**self).get_account_equity().await
    }

    async fn get_order_book(&self, symbol: &str) -> ExchangeResult<BookTop> {
        (**self).get_order_book(symbol).await
    }

    async fn submit_order(&self, order: &NewOrder) -> ExchangeResult<OrderAck> {
        (**self).submit_order(order).await
    }

    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> ExchangeResult<()> {
        (**self).cancel_order(symbol, order_id).await
    }

    async fn get_order_status(&self, symbol: &str, order_id: OrderId) -> ExchangeResult<OrderState> {
        (**self).get_order_status(symbol, order_id).await
    }

    async fn find_order(&self, symbol: &str, client_order_id: &str) -> ExchangeResult<Option<OrderState>> {
        (**self).find_order(symbol, client_order_id).await
    }
}
