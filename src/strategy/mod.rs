//! Signal pipeline from strategy adapters to trade intents.
//!
//! - Strategy registry and built-in adapters
//! - Per-strategy rebalance scheduling with persisted cadence state
//! - Risk-parity position sizing
//! - Multi-strategy aggregation with capital reallocation and caps
//! - Target vs live trade deltas

mod aggregator;
mod delta;
mod registry;
mod scheduler;
mod sizer;

pub use aggregator::{
    AllocationReport, AllocationStatus, Aggregation, SignalAggregator, SizedPosition,
    TargetPortfolio,
};
pub use delta::{DeltaCalculator, ExecutionPlan, IntentKind, LivePosition, TradeIntent};
pub use registry::{
    MomentumAdapter, Signal, StaticWeightsAdapter, StrategyAdapter, StrategyParams,
    StrategyRegistry, Weights,
};
pub use scheduler::{RebalanceHistoryEntry, RebalanceScheduler, RebalanceState, ScheduleStore};
pub use sizer::{PositionSizer, SizingResult};
