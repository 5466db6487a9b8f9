//! Dry-run wrapper: real reads, logged writes.

use super::error::{ExchangeError, ExchangeResult};
use super::traits::Exchange;
use super::types::*;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use tracing::{info, instrument};

/// Wraps a venue so that nothing is ever sent to it.
///
/// Positions, equity and books come from the inner venue. Submitted orders are
/// logged and reported back as immediately filled at the aggressive touch, so
/// the execution state machine runs exactly as it would live.
pub struct DryRunExchange<E> {
    inner: E,
    orders: Mutex<SimulatedOrders>,
    order_id_counter: AtomicI64,
}

#[derive(Default)]
struct SimulatedOrders {
    by_id: HashMap<OrderId, OrderState>,
    by_client_id: HashMap<String, OrderId>,
}

impl<E: Exchange> DryRunExchange<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            orders: Mutex::new(SimulatedOrders::default()),
            order_id_counter: AtomicI64::new(1),
        }
    }

    /// The wrapped venue.
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Orders that would have been sent.
    pub fn simulated_orders(&self) -> Vec<OrderState> {
        let mut orders: Vec<OrderState> = self
            .orders
            .lock()
            .map(|orders| orders.by_id.values().cloned().collect())
            .unwrap_or_default();
        orders.sort_by_key(|o| o.order_id);
        orders
    }

    fn lock_orders(&self) -> ExchangeResult<std::sync::MutexGuard<'_, SimulatedOrders>> {
        self.orders
            .lock()
            .map_err(|e| ExchangeError::Transport(format!("dry-run order book poisoned: {e}")))
    }
}

#[async_trait]
impl<E: Exchange> Exchange for DryRunExchange<E> {
    fn name(&self) -> &str {
        "dry-run"
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        self.inner.get_positions().await
    }

    #[instrument(skip(self))]
    async fn get_account_equity(&self) -> ExchangeResult<Decimal> {
        self.inner.get_account_equity().await
    }

    #[instrument(skip(self))]
    async fn get_order_book(&self, symbol: &str) -> ExchangeResult<BookTop> {
        self.inner.get_order_book(symbol).await
    }

    #[instrument(skip(self))]
    async fn submit_order(&self, order: &NewOrder) -> ExchangeResult<OrderAck> {
        let fill_price = match (order.order_type, order.price) {
            (OrderType::Limit, Some(price)) => price,
            _ => self.inner.get_order_book(&order.symbol).await?.far(order.side),
        };

        let order_id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);
        info!(
            venue = self.inner.name(),
            order_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity,
            price = ?order.price,
            "🧪 [DRY RUN] Would submit order"
        );

        let state = OrderState {
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            price: order.price,
            quantity: order.quantity,
            filled_quantity: order.quantity,
            avg_price: fill_price,
            status: OrderStatus::Filled,
        };
        let mut orders = self.lock_orders()?;
        if let Some(client_id) = &order.client_order_id {
            orders.by_client_id.insert(client_id.clone(), order_id);
        }
        orders.by_id.insert(order_id, state);

        Ok(OrderAck {
            order_id,
            symbol: order.symbol.clone(),
            status: OrderStatus::Filled,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: OrderId) -> ExchangeResult<()> {
        info!(%symbol, order_id, "🧪 [DRY RUN] Would cancel order");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order_status(&self, _symbol: &str, order_id: OrderId) -> ExchangeResult<OrderState> {
        self.lock_orders()?
            .by_id
            .get(&order_id)
            .cloned()
            .ok_or(ExchangeError::UnknownOrder(order_id))
    }

    #[instrument(skip(self))]
    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> ExchangeResult<Option<OrderState>> {
        let orders = self.lock_orders()?;
        Ok(orders
            .by_client_id
            .get(client_order_id)
            .and_then(|order_id| orders.by_id.get(order_id))
            .cloned())
    }
}
