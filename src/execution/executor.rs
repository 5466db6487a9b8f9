//! Async driver for the order state machine.
//!
//! Each trade intent runs in its own task. Workers share nothing but the
//! append-only trade log channel. Reads, cancels and lookups go through the
//! retry policy; submits are sent once and recovered by the state machine.
//! The only waits are bounded sleeps between status polls.

use super::machine::{Command, Event, MachineParams, OrderMachine, Phase};
use crate::config::{ExecutionConfig, ExecutionMode};
use crate::exchange::{with_retry, Exchange, OrderId, OrderSide, OrderType, RetryPolicy};
use crate::market::Universe;
use crate::strategy::{ExecutionPlan, TradeIntent};
use crate::utils::round_down_to_lot;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Distinguishes client order ids of intents started in the same millisecond.
static INTENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Execution knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub mode: ExecutionMode,
    pub limit_timeout: Duration,
    pub poll_interval: Duration,
    pub max_reprices: u32,
    pub reprice_step: Decimal,
    pub default_tick_size: Decimal,
    pub default_lot_size: Decimal,
}

impl ExecutionSettings {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            mode: config.mode,
            limit_timeout: Duration::from_millis(config.limit_timeout_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            max_reprices: config.max_reprices,
            reprice_step: config.reprice_step,
            default_tick_size: config.default_tick_size,
            default_lot_size: config.default_lot_size,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalState {
    Filled,
    Abandoned,
}

/// How one trade intent ended.
#[derive(Debug, Clone, Serialize)]
pub struct IntentOutcome {
    pub intent: TradeIntent,
    pub final_state: FinalState,
    /// Why the intent was abandoned
    pub reason: Option<String>,
    pub requested_quantity: Decimal,
    pub filled_quantity: Decimal,
    pub average_price: Option<Decimal>,
    pub phases: Vec<String>,
}

impl IntentOutcome {
    pub fn is_abandoned(&self) -> bool {
        self.final_state == FinalState::Abandoned
    }

    fn abandoned(intent: TradeIntent, reason: String) -> Self {
        Self {
            intent,
            final_state: FinalState::Abandoned,
            reason: Some(reason),
            requested_quantity: Decimal::ZERO,
            filled_quantity: Decimal::ZERO,
            average_price: None,
            phases: vec!["ABANDONED".to_string()],
        }
    }
}

/// One fill appended to the trade log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub venue: String,
    pub instrument: String,
    pub exchange_symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub order_id: OrderId,
    pub quantity: Decimal,
    pub price: Decimal,
}

pub struct ExecutionEngine {
    exchange: Arc<dyn Exchange>,
    settings: ExecutionSettings,
    retry: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(exchange: Arc<dyn Exchange>, settings: ExecutionSettings, retry: RetryPolicy) -> Self {
        Self {
            exchange,
            settings,
            retry,
        }
    }

    /// Run every wave of `plan`; intents within a wave run concurrently.
    ///
    /// Returns one outcome per intent, in plan order.
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        universe: &Universe,
        trade_log: mpsc::UnboundedSender<TradeRecord>,
    ) -> Vec<IntentOutcome> {
        let mut outcomes = Vec::with_capacity(plan.len());

        for (wave_idx, wave) in plan.waves.iter().enumerate() {
            info!(
                wave = wave_idx + 1,
                waves = plan.waves.len(),
                intents = wave.len(),
                mode = ?self.settings.mode,
                venue = self.exchange.name(),
                "⚡ [EXEC] Starting wave"
            );

            let mut workers = JoinSet::new();
            for (idx, intent) in wave.iter().enumerate() {
                let (tick_size, lot_size) = universe
                    .get(&intent.instrument)
                    .map(|spec| (spec.tick_size, spec.lot_size))
                    .unwrap_or((self.settings.default_tick_size, self.settings.default_lot_size));

                let exchange = Arc::clone(&self.exchange);
                let settings = self.settings.clone();
                let retry = self.retry.clone();
                let intent = intent.clone();
                let trade_log = trade_log.clone();
                workers.spawn(async move {
                    let outcome =
                        execute_intent(exchange, settings, retry, intent, tick_size, lot_size, trade_log).await;
                    (idx, outcome)
                });
            }

            let mut slots: Vec<Option<IntentOutcome>> = vec![None; wave.len()];
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok((idx, outcome)) => slots[idx] = Some(outcome),
                    Err(e) => error!(error = %e, "Execution worker failed"),
                }
            }

            for (slot, intent) in slots.into_iter().zip(wave) {
                outcomes.push(slot.unwrap_or_else(|| {
                    IntentOutcome::abandoned(intent.clone(), "execution worker failed".to_string())
                }));
            }
        }

        outcomes
    }
}

/// Drive one intent to `FILLED` or `ABANDONED`.
pub async fn execute_intent(
    exchange: Arc<dyn Exchange>,
    settings: ExecutionSettings,
    retry: RetryPolicy,
    intent: TradeIntent,
    tick_size: Decimal,
    lot_size: Decimal,
    trade_log: mpsc::UnboundedSender<TradeRecord>,
) -> IntentOutcome {
    let quantity = if intent.reference_price > Decimal::ZERO {
        round_down_to_lot(intent.delta_notional.abs() / intent.reference_price, lot_size)
    } else {
        Decimal::ZERO
    };
    let symbol = intent.exchange_symbol.clone();

    info!(
        instrument = %intent.instrument,
        %symbol,
        side = %intent.side,
        notional = %intent.delta_notional.round_dp(2),
        %quantity,
        "⚡ [EXEC] Executing intent"
    );

    let mut machine = OrderMachine::new(MachineParams {
        mode: settings.mode,
        symbol: symbol.clone(),
        side: intent.side,
        quantity,
        reference_price: intent.reference_price,
        tick_size,
        lot_size,
        max_reprices: settings.max_reprices,
        reprice_step: settings.reprice_step,
        client_tag: format!(
            "rb-{}-{}-{}",
            symbol,
            Utc::now().timestamp_millis(),
            INTENT_SEQ.fetch_add(1, Ordering::Relaxed)
        ),
        max_submit_attempts: retry.max_attempts,
    });
    let submit_policy = RetryPolicy::no_retry(retry.call_timeout);

    let mut deadline = Instant::now() + settings.limit_timeout;
    let mut command = machine.step(Event::Start);

    loop {
        let event = match command {
            Command::Finish => break,
            Command::FetchBook => {
                match with_retry(&retry, "get_order_book", || exchange.get_order_book(&symbol)).await {
                    Ok(book) => Event::Book(book),
                    Err(e) => Event::Failed(e),
                }
            }
            Command::Submit(order) => {
                let result = with_retry(&submit_policy, "submit_order", || exchange.submit_order(&order)).await;
                deadline = Instant::now() + settings.limit_timeout;
                match result {
                    Ok(ack) => Event::Accepted(ack),
                    Err(e) => Event::Failed(e),
                }
            }
            Command::Poll { order_id } => {
                let now = Instant::now();
                if now >= deadline {
                    Event::Expired
                } else {
                    tokio::time::sleep(settings.poll_interval.min(deadline - now)).await;
                    match with_retry(&retry, "get_order_status", || {
                        exchange.get_order_status(&symbol, order_id)
                    })
                    .await
                    {
                        Ok(state) => Event::Status(state),
                        Err(e) => Event::Failed(e),
                    }
                }
            }
            Command::Locate { client_id } => {
                match with_retry(&retry, "find_order", || exchange.find_order(&symbol, &client_id)).await {
                    Ok(found) => Event::Located(found),
                    Err(e) => Event::Failed(e),
                }
            }
            Command::CancelAndReconcile { order_id } => {
                match with_retry(&retry, "cancel_order", || exchange.cancel_order(&symbol, order_id)).await {
                    Err(e) => Event::Failed(e),
                    Ok(()) => match with_retry(&retry, "get_order_status", || {
                        exchange.get_order_status(&symbol, order_id)
                    })
                    .await
                    {
                        Ok(state) => Event::Reconciled(state),
                        Err(e) => Event::Failed(e),
                    },
                }
            }
        };

        command = machine.step(event);

        for execution in machine.take_new_executions() {
            let record = TradeRecord {
                timestamp: Utc::now(),
                venue: exchange.name().to_string(),
                instrument: intent.instrument.clone(),
                exchange_symbol: symbol.clone(),
                side: intent.side,
                order_type: execution.order_type,
                order_id: execution.order_id,
                quantity: execution.quantity,
                price: execution.avg_price,
            };
            if trade_log.send(record).is_err() {
                warn!(%symbol, "Trade log receiver dropped");
            }
        }
    }

    let (final_state, reason) = match machine.phase() {
        Phase::Filled => (FinalState::Filled, None),
        Phase::Abandoned { reason } => (FinalState::Abandoned, Some(reason.clone())),
        other => (FinalState::Abandoned, Some(format!("stopped in {:?}", other))),
    };

    let outcome = IntentOutcome {
        intent,
        final_state,
        reason,
        requested_quantity: quantity,
        filled_quantity: machine.filled_quantity(),
        average_price: machine.average_price(),
        phases: machine.phases().iter().map(|p| p.to_string()).collect(),
    };

    match outcome.final_state {
        FinalState::Filled => info!(
            instrument = %outcome.intent.instrument,
            filled = %outcome.filled_quantity,
            avg_price = ?outcome.average_price,
            phases = ?outcome.phases,
            "✅ [EXEC] Intent filled"
        ),
        FinalState::Abandoned => warn!(
            instrument = %outcome.intent.instrument,
            filled = %outcome.filled_quantity,
            reason = ?outcome.reason,
            "❌ [EXEC] Intent abandoned"
        ),
    }

    outcome
}
