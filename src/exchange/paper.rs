//! Paper trading venue.
//!
//! Simulates a top of book around the latest known price, fills market orders
//! at the far touch, rests limit orders until they cross, and keeps cash and
//! positions so that daily runs see the consequences of previous cycles.

use super::error::{ExchangeError, ExchangeResult};
use super::traits::Exchange;
use super::types::*;
use crate::config::PaperConfig;
use crate::utils::{from_basis_points, weighted_average};
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Simulated gross exposure limit as a multiple of equity.
const MAX_LEVERAGE: Decimal = dec!(10);

/// Simulated position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaperPosition {
    pub symbol: String,
    /// Signed base quantity
    pub quantity: Decimal,
    pub avg_entry_price: Decimal,
}

/// Durable part of the paper account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperSnapshot {
    pub balance: Decimal,
    pub positions: Vec<PaperPosition>,
    pub total_fees: Decimal,
    pub order_count: u64,
}

#[derive(Debug)]
struct PaperState {
    balance: Decimal,
    positions: HashMap<String, PaperPosition>,
    orders: HashMap<OrderId, OrderState>,
    client_orders: HashMap<String, OrderId>,
    prices: HashMap<String, Decimal>,
    total_fees: Decimal,
    order_count: u64,
}

/// Paper exchange with in-memory order book simulation.
pub struct PaperExchange {
    state: RwLock<PaperState>,
    order_id_counter: AtomicI64,
    /// Half of the configured full spread, as a fraction of price
    half_spread: Decimal,
    fee_rate: Decimal,
    resting_fill_fraction: Decimal,
}

impl PaperExchange {
    /// Create a paper account with the configured starting balance.
    pub fn new(config: &PaperConfig) -> Self {
        Self {
            state: RwLock::new(PaperState {
                balance: config.initial_balance,
                positions: HashMap::new(),
                orders: HashMap::new(),
                client_orders: HashMap::new(),
                prices: HashMap::new(),
                total_fees: Decimal::ZERO,
                order_count: 0,
            }),
            order_id_counter: AtomicI64::new(1),
            half_spread: from_basis_points(config.spread_bps) / dec!(2),
            fee_rate: config.fee_rate,
            resting_fill_fraction: config.resting_fill_fraction.clamp(Decimal::ZERO, Decimal::ONE),
        }
    }

    /// Replace all reference prices (typically the latest candle closes).
    pub async fn set_prices(&self, prices: HashMap<String, Decimal>) {
        self.state.write().await.prices = prices;
    }

    /// Move a single reference price.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    /// Export durable state for persistence.
    pub async fn export_state(&self) -> PaperSnapshot {
        let state = self.state.read().await;
        let mut positions: Vec<PaperPosition> = state.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        PaperSnapshot {
            balance: state.balance,
            positions,
            total_fees: state.total_fees,
            order_count: state.order_count,
        }
    }

    /// Restore durable state from persistence.
    pub async fn restore_state(&self, snapshot: PaperSnapshot) {
        let mut state = self.state.write().await;
        state.balance = snapshot.balance;
        state.total_fees = snapshot.total_fees;
        state.order_count = snapshot.order_count;
        // Order ids keep counting across runs so trade log ids stay unique
        let next_id = i64::try_from(snapshot.order_count).unwrap_or(i64::MAX - 1) + 1;
        self.order_id_counter.store(next_id, Ordering::SeqCst);
        state.positions = snapshot
            .positions
            .into_iter()
            .filter(|p| p.quantity != Decimal::ZERO)
            .map(|p| (p.symbol.clone(), p))
            .collect();
        info!(
            balance = %state.balance,
            positions = state.positions.len(),
            "Paper account restored"
        );
    }

    fn next_order_id(&self) -> OrderId {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn book_for(&self, state: &PaperState, symbol: &str) -> ExchangeResult<BookTop> {
        let price = state
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InvalidInstrument(symbol.to_string()))?;
        Ok(BookTop {
            symbol: symbol.to_string(),
            bid_price: price * (Decimal::ONE - self.half_spread),
            bid_qty: dec!(1_000_000),
            ask_price: price * (Decimal::ONE + self.half_spread),
            ask_qty: dec!(1_000_000),
        })
    }

    fn equity_of(state: &PaperState) -> Decimal {
        state.balance
            + state
                .positions
                .values()
                .map(|p| {
                    let mark = state.prices.get(&p.symbol).copied().unwrap_or(p.avg_entry_price);
                    p.quantity * mark
                })
                .sum::<Decimal>()
    }

    fn gross_after(state: &PaperState, symbol: &str, signed_qty: Decimal) -> Decimal {
        state
            .positions
            .values()
            .map(|p| {
                let mark = state.prices.get(&p.symbol).copied().unwrap_or(p.avg_entry_price);
                let qty = if p.symbol == symbol {
                    p.quantity + signed_qty
                } else {
                    p.quantity
                };
                (qty * mark).abs()
            })
            .sum::<Decimal>()
            + if state.positions.contains_key(symbol) {
                Decimal::ZERO
            } else {
                (signed_qty * state.prices.get(symbol).copied().unwrap_or_default()).abs()
            }
    }

    /// Apply a fill to cash and positions.
    fn apply_fill(&self, state: &mut PaperState, symbol: &str, side: OrderSide, qty: Decimal, price: Decimal) {
        let signed_qty = qty * side.sign();
        let notional = qty * price;
        let fee = notional * self.fee_rate;

        state.balance -= signed_qty * price + fee;
        state.total_fees += fee;

        let position = state
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| PaperPosition {
                symbol: symbol.to_string(),
                ..Default::default()
            });

        let new_qty = position.quantity + signed_qty;
        let same_direction = position.quantity.is_zero()
            || (position.quantity > Decimal::ZERO) == (signed_qty > Decimal::ZERO);
        if same_direction && !new_qty.is_zero() {
            position.avg_entry_price = weighted_average(&[
                (position.avg_entry_price, position.quantity.abs()),
                (price, qty),
            ]);
        } else if !new_qty.is_zero() && (new_qty > Decimal::ZERO) != (position.quantity > Decimal::ZERO) {
            // Flipped through zero: the residual was opened at this price
            position.avg_entry_price = price;
        }
        position.quantity = new_qty;

        if new_qty.is_zero() {
            state.positions.remove(symbol);
        }

        debug!(%symbol, side = %side, %qty, %price, %fee, "Paper fill");
    }

    /// Fill whatever a working limit order can fill against the current book.
    fn match_resting(&self, state: &mut PaperState, order_id: OrderId) -> ExchangeResult<()> {
        let Some(order) = state.orders.get(&order_id).cloned() else {
            return Err(ExchangeError::UnknownOrder(order_id));
        };
        if !order.status.is_working() {
            return Ok(());
        }

        let book = self.book_for(state, &order.symbol)?;
        let limit = order.price.unwrap_or_default();
        let crosses = match order.side {
            OrderSide::Buy => limit >= book.ask_price,
            OrderSide::Sell => limit <= book.bid_price,
        };

        let (fill_qty, fill_price) = if crosses {
            (order.remaining(), book.far(order.side))
        } else if self.resting_fill_fraction > Decimal::ZERO {
            let slice = (order.quantity * self.resting_fill_fraction).min(order.remaining());
            (slice, limit)
        } else {
            return Ok(());
        };

        if fill_qty <= Decimal::ZERO {
            return Ok(());
        }

        self.apply_fill(state, &order.symbol, order.side, fill_qty, fill_price);

        if let Some(order) = state.orders.get_mut(&order_id) {
            let prev_notional = order.filled_quantity * order.avg_price;
            order.filled_quantity += fill_qty;
            order.avg_price = (prev_notional + fill_qty * fill_price) / order.filled_quantity;
            order.status = if order.remaining().is_zero() {
                OrderStatus::Filled
            } else {
                OrderStatus::PartiallyFilled
            };
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    #[instrument(skip(self))]
    async fn get_positions(&self) -> ExchangeResult<Vec<Position>> {
        let state = self.state.read().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| !p.quantity.is_zero())
            .map(|p| Position {
                symbol: p.symbol.clone(),
                quantity: p.quantity,
                mark_price: state.prices.get(&p.symbol).copied().unwrap_or(p.avg_entry_price),
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(positions)
    }

    #[instrument(skip(self))]
    async fn get_account_equity(&self) -> ExchangeResult<Decimal> {
        let state = self.state.read().await;
        Ok(Self::equity_of(&state))
    }

    #[instrument(skip(self))]
    async fn get_order_book(&self, symbol: &str) -> ExchangeResult<BookTop> {
        let state = self.state.read().await;
        self.book_for(&state, symbol)
    }

    #[instrument(skip(self))]
    async fn submit_order(&self, order: &NewOrder) -> ExchangeResult<OrderAck> {
        let mut state = self.state.write().await;
        let book = self.book_for(&state, &order.symbol)?;

        if let Some(client_id) = &order.client_order_id {
            if state.client_orders.contains_key(client_id) {
                return Err(ExchangeError::Rejected(format!(
                    "duplicate client order id {}",
                    client_id
                )));
            }
        }

        if order.quantity <= Decimal::ZERO {
            return Err(ExchangeError::Rejected(format!(
                "non-positive quantity {}",
                order.quantity
            )));
        }
        if order.order_type == OrderType::Limit && order.price.is_none() {
            return Err(ExchangeError::Rejected("limit order without price".to_string()));
        }

        let signed_qty = order.quantity * order.side.sign();
        let equity = Self::equity_of(&state);
        if Self::gross_after(&state, &order.symbol, signed_qty) > equity * MAX_LEVERAGE {
            return Err(ExchangeError::InsufficientMargin(format!(
                "{} {} {} exceeds {}x equity",
                order.side, order.quantity, order.symbol, MAX_LEVERAGE
            )));
        }

        let order_id = self.next_order_id();
        state.order_count += 1;
        if let Some(client_id) = &order.client_order_id {
            state.client_orders.insert(client_id.clone(), order_id);
        }
        state.orders.insert(
            order_id,
            OrderState {
                order_id,
                symbol: order.symbol.clone(),
                side: order.side,
                order_type: order.order_type,
                price: order.price,
                quantity: order.quantity,
                filled_quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
                status: OrderStatus::Open,
            },
        );

        match order.order_type {
            OrderType::Market => {
                let price = book.far(order.side);
                self.apply_fill(&mut state, &order.symbol, order.side, order.quantity, price);
                if let Some(o) = state.orders.get_mut(&order_id) {
                    o.filled_quantity = order.quantity;
                    o.avg_price = price;
                    o.status = OrderStatus::Filled;
                }
            }
            OrderType::Limit => {
                let limit = order.price.unwrap_or_default();
                let crosses = match order.side {
                    OrderSide::Buy => limit >= book.ask_price,
                    OrderSide::Sell => limit <= book.bid_price,
                };
                // A freshly posted passive order only trades once it is polled
                if crosses {
                    self.match_resting(&mut state, order_id)?;
                }
            }
        }

        let status = state
            .orders
            .get(&order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::Open);

        info!(
            order_id,
            symbol = %order.symbol,
            side = %order.side,
            order_type = %order.order_type,
            quantity = %order.quantity,
            price = ?order.price,
            status = ?status,
            "Paper order accepted"
        );

        Ok(OrderAck {
            order_id,
            symbol: order.symbol.clone(),
            status,
        })
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, _symbol: &str, order_id: OrderId) -> ExchangeResult<()> {
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or(ExchangeError::UnknownOrder(order_id))?;
        if order.status.is_working() {
            order.status = OrderStatus::Cancelled;
            debug!(order_id, filled = %order.filled_quantity, "Paper order cancelled");
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_order_status(&self, _symbol: &str, order_id: OrderId) -> ExchangeResult<OrderState> {
        let mut state = self.state.write().await;
        self.match_resting(&mut state, order_id)?;
        state
            .orders
            .get(&order_id)
            .cloned()
            .ok_or(ExchangeError::UnknownOrder(order_id))
    }

    #[instrument(skip(self))]
    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> ExchangeResult<Option<OrderState>> {
        let mut state = self.state.write().await;
        let Some(order_id) = state.client_orders.get(client_order_id).copied() else {
            return Ok(None);
        };
        self.match_resting(&mut state, order_id)?;
        Ok(state.orders.get(&order_id).cloned())
    }
}
