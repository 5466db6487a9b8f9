//! Order escalation state machine.
//!
//! The machine never performs I/O. The driver feeds it [`Event`]s describing
//! what the venue said and executes the [`Command`] it returns, until the
//! machine answers [`Command::Finish`].
//!
//! Aggressive mode walks a bounded ladder: a limit at the touch, up to
//! `max_reprices` reposts each priced further toward the far side, then a
//! market order for whatever is left. Simple mode sends one market order.
//!
//! Every submit carries a fresh client order id and is sent once. When a
//! submit fails transiently the machine first asks the venue whether that id
//! arrived, then reprices from a new book before posting again.

use crate::config::ExecutionMode;
use crate::exchange::{BookTop, ExchangeError, NewOrder, OrderAck, OrderId, OrderSide, OrderState, OrderStatus, OrderType};
use crate::utils::{round_down_to_lot, round_to_tick};
use rust_decimal::Decimal;
use serde::Serialize;

/// Hard ceiling on transitions for a single intent.
const MAX_STEPS: u32 = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    Pending,
    /// Waiting for a fresh book to price limit iteration `iteration`
    AwaitingBook { iteration: u32 },
    SubmittingLimit { iteration: u32, price: Decimal, client_id: String },
    PostedLimit { order_id: OrderId, price: Decimal, iteration: u32 },
    /// Limit timed out; cancel then read back the final fill
    Cancelling { order_id: OrderId, iteration: u32 },
    SubmittingMarket { client_id: String },
    /// A submit failed without a clear answer; checking whether it landed.
    /// `iteration` is `None` for the market leg.
    LocatingOrder { client_id: String, iteration: Option<u32> },
    CrossedMarket { order_id: OrderId },
    /// Unrecoverable error with an order possibly still working
    Abandoning { order_id: OrderId, reason: String },
    Filled,
    Abandoned { reason: String },
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Filled | Phase::Abandoned { .. })
    }
}

/// What the venue reported.
#[derive(Debug, Clone)]
pub enum Event {
    Start,
    Book(BookTop),
    Accepted(OrderAck),
    Status(OrderState),
    /// The working order's time budget ran out
    Expired,
    /// Order state read back after a cancel
    Reconciled(OrderState),
    /// Result of looking up a client order id
    Located(Option<OrderState>),
    Failed(ExchangeError),
}

/// What the driver must do next.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FetchBook,
    Submit(NewOrder),
    Poll { order_id: OrderId },
    CancelAndReconcile { order_id: OrderId },
    Locate { client_id: String },
    Finish,
}

/// A completed order's contribution to the intent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Execution {
    pub order_id: OrderId,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub avg_price: Decimal,
}

/// Static inputs of one intent's escalation.
#[derive(Debug, Clone)]
pub struct MachineParams {
    pub mode: ExecutionMode,
    pub symbol: String,
    pub side: OrderSide,
    /// Total base quantity, already rounded to lot size
    pub quantity: Decimal,
    /// Used as the fill price when simple mode finishes on acknowledgement
    pub reference_price: Decimal,
    pub tick_size: Decimal,
    pub lot_size: Decimal,
    pub max_reprices: u32,
    pub reprice_step: Decimal,
    /// Prefix of every client order id this intent submits
    pub client_tag: String,
    /// Submits that may fail transiently before the intent is abandoned
    pub max_submit_attempts: u32,
}

/// Limit price for ladder iteration `iteration`.
///
/// Moves `min(1, iteration * step)` of the way from the touch to the far side,
/// at least `iteration` ticks away from the touch, never past the far side.
pub fn ladder_price(book: &BookTop, side: OrderSide, iteration: u32, step: Decimal, tick: Decimal) -> Decimal {
    let touch = book.touch(side);
    let far = book.far(side);
    let k = Decimal::from(iteration);
    let fraction = (k * step).min(Decimal::ONE);
    let raw = touch + fraction * (far - touch);
    let min_move = k * tick;

    match side {
        OrderSide::Buy => round_to_tick(raw.max(touch + min_move), tick).min(far),
        OrderSide::Sell => round_to_tick(raw.min(touch - min_move), tick).max(far),
    }
}

pub struct OrderMachine {
    params: MachineParams,
    phase: Phase,
    settled_qty: Decimal,
    settled_notional: Decimal,
    /// Fill of the order currently working: (quantity, average price)
    working_fill: (Decimal, Decimal),
    executions: Vec<Execution>,
    unreported: usize,
    phases: Vec<&'static str>,
    steps: u32,
    submits: u32,
    submit_failures: u32,
}

impl OrderMachine {
    pub fn new(params: MachineParams) -> Self {
        Self {
            params,
            phase: Phase::Pending,
            settled_qty: Decimal::ZERO,
            settled_notional: Decimal::ZERO,
            working_fill: (Decimal::ZERO, Decimal::ZERO),
            executions: Vec::new(),
            unreported: 0,
            phases: vec!["PENDING"],
            steps: 0,
            submits: 0,
            submit_failures: 0,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    /// Milestones visited, in order.
    pub fn phases(&self) -> &[&'static str] {
        &self.phases
    }

    pub fn requested_quantity(&self) -> Decimal {
        self.params.quantity
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.settled_qty + self.working_fill.0
    }

    pub fn average_price(&self) -> Option<Decimal> {
        let qty = self.filled_quantity();
        if qty.is_zero() {
            return None;
        }
        Some((self.settled_notional + self.working_fill.0 * self.working_fill.1) / qty)
    }

    pub fn executions(&self) -> &[Execution] {
        &self.executions
    }

    /// Executions completed since the last call.
    pub fn take_new_executions(&mut self) -> Vec<Execution> {
        let fresh = self.executions[self.unreported..].to_vec();
        self.unreported = self.executions.len();
        fresh
    }

    /// Advance on `event`.
    pub fn step(&mut self, event: Event) -> Command {
        self.steps += 1;
        if self.steps > MAX_STEPS && !self.phase.is_terminal() {
            return self.abandon(format!("exceeded {} state transitions", MAX_STEPS));
        }

        let phase = std::mem::replace(&mut self.phase, Phase::Pending);
        match (phase, event) {
            (Phase::Pending, Event::Start) => self.start(),

            (Phase::AwaitingBook { iteration }, Event::Book(book)) => {
                let remaining = self.remaining();
                if remaining <= Decimal::ZERO {
                    return self.fill();
                }
                let price = ladder_price(
                    &book,
                    self.params.side,
                    iteration,
                    self.params.reprice_step,
                    self.params.tick_size,
                );
                let client_id = self.next_client_id(&format!("L{}", iteration));
                self.phase = Phase::SubmittingLimit {
                    iteration,
                    price,
                    client_id: client_id.clone(),
                };
                Command::Submit(
                    NewOrder::limit(&self.params.symbol, self.params.side, remaining, price).with_client_id(client_id),
                )
            }

            (Phase::SubmittingLimit { iteration, price, .. }, Event::Accepted(ack)) => {
                if ack.status == OrderStatus::Rejected {
                    return self.abandon(format!("limit order {} rejected", ack.order_id));
                }
                self.working_fill = (Decimal::ZERO, Decimal::ZERO);
                self.mark("POSTED_LIMIT");
                self.phase = Phase::PostedLimit {
                    order_id: ack.order_id,
                    price,
                    iteration,
                };
                Command::Poll { order_id: ack.order_id }
            }

            (Phase::PostedLimit { order_id, price, iteration }, Event::Status(state)) => {
                self.working_fill = (state.filled_quantity, state.avg_price);
                match state.status {
                    OrderStatus::Filled => {
                        self.settle(&state);
                        self.fill()
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        self.settle(&state);
                        self.after_limit(iteration)
                    }
                    OrderStatus::Open | OrderStatus::PartiallyFilled => {
                        if state.filled_quantity > Decimal::ZERO {
                            self.mark("PARTIALLY_FILLED");
                        }
                        self.phase = Phase::PostedLimit { order_id, price, iteration };
                        Command::Poll { order_id }
                    }
                }
            }

            (Phase::PostedLimit { order_id, iteration, .. }, Event::Expired) => {
                self.phase = Phase::Cancelling { order_id, iteration };
                Command::CancelAndReconcile { order_id }
            }

            (Phase::Cancelling { iteration, .. }, Event::Reconciled(state)) => {
                self.settle(&state);
                self.after_limit(iteration)
            }

            (Phase::SubmittingLimit { iteration, client_id, .. }, Event::Failed(e)) if e.is_transient() => {
                self.submit_failures += 1;
                self.phase = Phase::LocatingOrder {
                    client_id: client_id.clone(),
                    iteration: Some(iteration),
                };
                Command::Locate { client_id }
            }

            (Phase::SubmittingMarket { client_id }, Event::Failed(e)) if e.is_transient() => {
                self.submit_failures += 1;
                self.phase = Phase::LocatingOrder {
                    client_id: client_id.clone(),
                    iteration: None,
                };
                Command::Locate { client_id }
            }

            // The order did arrive: adopt it instead of sending another
            (Phase::LocatingOrder { iteration: Some(iteration), .. }, Event::Located(Some(state))) => {
                self.working_fill = (Decimal::ZERO, Decimal::ZERO);
                self.mark("POSTED_LIMIT");
                self.phase = Phase::PostedLimit {
                    order_id: state.order_id,
                    price: state.price.unwrap_or_default(),
                    iteration,
                };
                self.step(Event::Status(state))
            }

            (Phase::LocatingOrder { iteration: None, .. }, Event::Located(Some(state))) => {
                self.working_fill = (Decimal::ZERO, Decimal::ZERO);
                self.mark("CROSSED_MARKET");
                self.phase = Phase::CrossedMarket {
                    order_id: state.order_id,
                };
                self.step(Event::Status(state))
            }

            (Phase::LocatingOrder { client_id, iteration }, Event::Located(None)) => {
                if self.submit_failures >= self.params.max_submit_attempts {
                    return self.abandon(format!(
                        "submit failed {} times, last client id {}",
                        self.submit_failures, client_id
                    ));
                }
                match iteration {
                    // Reprice from a fresh book rather than resend a stale price
                    Some(iteration) => {
                        self.phase = Phase::AwaitingBook { iteration };
                        Command::FetchBook
                    }
                    None => self.market_remainder(),
                }
            }

            (Phase::LocatingOrder { client_id, .. }, Event::Failed(e)) => {
                self.abandon(format!("could not verify submit {}: {}", client_id, e))
            }

            (Phase::SubmittingMarket { .. }, Event::Accepted(ack)) => {
                if ack.status == OrderStatus::Rejected {
                    return self.abandon(format!("market order {} rejected", ack.order_id));
                }
                self.mark("CROSSED_MARKET");
                if self.params.mode == ExecutionMode::Simple {
                    let quantity = self.remaining();
                    self.record(Execution {
                        order_id: ack.order_id,
                        order_type: OrderType::Market,
                        quantity,
                        avg_price: self.params.reference_price,
                    });
                    return self.fill();
                }
                self.working_fill = (Decimal::ZERO, Decimal::ZERO);
                self.phase = Phase::CrossedMarket { order_id: ack.order_id };
                Command::Poll { order_id: ack.order_id }
            }

            (Phase::CrossedMarket { order_id }, Event::Status(state)) => {
                self.working_fill = (state.filled_quantity, state.avg_price);
                match state.status {
                    OrderStatus::Filled => {
                        self.settle(&state);
                        self.fill()
                    }
                    OrderStatus::Cancelled | OrderStatus::Rejected => {
                        self.settle(&state);
                        if self.remaining() <= Decimal::ZERO {
                            self.fill()
                        } else {
                            self.abandon(format!("market order {} ended {:?}", order_id, state.status))
                        }
                    }
                    OrderStatus::Open | OrderStatus::PartiallyFilled => {
                        self.phase = Phase::CrossedMarket { order_id };
                        Command::Poll { order_id }
                    }
                }
            }

            (Phase::CrossedMarket { order_id }, Event::Expired) => {
                self.phase = Phase::Abandoning {
                    order_id,
                    reason: format!("market order {} not filled in time", order_id),
                };
                Command::CancelAndReconcile { order_id }
            }

            (Phase::Abandoning { reason, .. }, Event::Reconciled(state)) => {
                self.settle(&state);
                self.abandon(reason)
            }

            (Phase::Abandoning { reason, .. }, Event::Failed(e)) => {
                self.abandon(format!("{}; cleanup failed: {}", reason, e))
            }

            (Phase::PostedLimit { order_id, .. }, Event::Failed(e))
            | (Phase::Cancelling { order_id, .. }, Event::Failed(e))
            | (Phase::CrossedMarket { order_id }, Event::Failed(e)) => {
                self.phase = Phase::Abandoning {
                    order_id,
                    reason: e.to_string(),
                };
                Command::CancelAndReconcile { order_id }
            }

            (_, Event::Failed(e)) => self.abandon(e.to_string()),

            (phase @ (Phase::Filled | Phase::Abandoned { .. }), _) => {
                self.phase = phase;
                Command::Finish
            }

            (phase, event) => self.abandon(format!("unexpected {:?} in {:?}", event, phase)),
        }
    }

    fn start(&mut self) -> Command {
        if self.params.quantity <= Decimal::ZERO {
            return self.fill();
        }
        match self.params.mode {
            ExecutionMode::Simple => self.market_remainder(),
            ExecutionMode::Aggressive => {
                self.phase = Phase::AwaitingBook { iteration: 0 };
                Command::FetchBook
            }
        }
    }

    /// Next move after a limit order is finished.
    fn after_limit(&mut self, iteration: u32) -> Command {
        if self.remaining() <= Decimal::ZERO {
            return self.fill();
        }
        if iteration < self.params.max_reprices {
            self.mark("REPRICED");
            self.phase = Phase::AwaitingBook {
                iteration: iteration + 1,
            };
            Command::FetchBook
        } else {
            self.market_remainder()
        }
    }

    fn market_remainder(&mut self) -> Command {
        let remaining = self.remaining();
        if remaining <= Decimal::ZERO {
            return self.fill();
        }
        let client_id = self.next_client_id("M");
        self.phase = Phase::SubmittingMarket {
            client_id: client_id.clone(),
        };
        Command::Submit(NewOrder::market(&self.params.symbol, self.params.side, remaining).with_client_id(client_id))
    }

    /// Client ids are unique per submit, never reused on a retry.
    fn next_client_id(&mut self, leg: &str) -> String {
        self.submits += 1;
        format!("{}-{}-{}", self.params.client_tag, leg, self.submits)
    }

    /// Remaining quantity that can still be ordered.
    fn remaining(&self) -> Decimal {
        round_down_to_lot(
            (self.params.quantity - self.filled_quantity()).max(Decimal::ZERO),
            self.params.lot_size,
        )
    }

    /// Move the working order's fill into the settled totals.
    fn settle(&mut self, state: &OrderState) {
        self.working_fill = (Decimal::ZERO, Decimal::ZERO);
        if state.filled_quantity > Decimal::ZERO {
            self.record(Execution {
                order_id: state.order_id,
                order_type: state.order_type,
                quantity: state.filled_quantity,
                avg_price: state.avg_price,
            });
        }
    }

    fn record(&mut self, execution: Execution) {
        self.settled_qty += execution.quantity;
        self.settled_notional += execution.quantity * execution.avg_price;
        self.executions.push(execution);
    }

    fn mark(&mut self, label: &'static str) {
        if self.phases.last() != Some(&label) {
            self.phases.push(label);
        }
    }

    fn fill(&mut self) -> Command {
        self.mark("FILLED");
        self.phase = Phase::Filled;
        Command::Finish
    }

    fn abandon(&mut self, reason: String) -> Command {
        self.mark("ABANDONED");
        self.phase = Phase::Abandoned { reason };
        Command::Finish
    }
}
