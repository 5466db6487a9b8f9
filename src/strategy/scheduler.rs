//! Per-strategy rebalance cadence.
//!
//! Each strategy has one persisted [`RebalanceState`]. A strategy recomputes
//! its signal when it has no state yet or when today has reached its next
//! rebalance date; on other days its cached weights are reused unchanged, so
//! positions drift between rebalances.

use super::registry::Weights;
use crate::config::StrategyConfig;
use anyhow::Result;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// One past rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceHistoryEntry {
    pub date: NaiveDate,
    pub weights: Weights,
    pub instruments: usize,
}

/// Persisted schedule state of one strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebalanceState {
    pub strategy_name: String,
    pub cadence_days: u32,
    pub last_rebalance_date: Option<NaiveDate>,
    pub next_rebalance_date: NaiveDate,
    pub current_weights: Weights,
    /// Oldest first, bounded by the configured capacity
    #[serde(default)]
    pub history: VecDeque<RebalanceHistoryEntry>,
}

/// Durable key-value storage of schedule state, keyed by strategy name.
#[cfg_attr(test, mockall::automock)]
pub trait ScheduleStore {
    /// Load a strategy's state. `Ok(None)` when none exists; `Err` when the
    /// record cannot be read or decoded.
    fn load_state(&self, strategy: &str) -> Result<Option<RebalanceState>>;

    /// Atomically replace a strategy's state.
    fn save_state(&self, state: &RebalanceState) -> Result<()>;

    /// Every readable state, ordered by strategy name.
    fn load_all_states(&self) -> Result<Vec<RebalanceState>>;
}

impl<T: ScheduleStore + ?Sized> ScheduleStore for &T {
    fn load_state(&self, strategy: &str) -> Result<Option<RebalanceState>> {
        (**self).load_state(strategy)
    }

    fn save_state(&self, state: &RebalanceState) -> Result<()> {
        (**self).save_state(state)
    }

    fn load_all_states(&self) -> Result<Vec<RebalanceState>> {
        (**self).load_all_states()
    }
}

/// Decides which strategies recompute today and records their results.
pub struct RebalanceScheduler<S> {
    store: S,
    today: NaiveDate,
    history_capacity: usize,
}

impl<S: ScheduleStore> RebalanceScheduler<S> {
    pub fn new(store: S, today: NaiveDate, history_capacity: usize) -> Self {
        Self {
            store,
            today,
            history_capacity: history_capacity.max(1),
        }
    }

    pub fn today(&self) -> NaiveDate {
        self.today
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Read state, treating unreadable records as absent.
    fn load(&self, strategy: &str) -> Option<RebalanceState> {
        match self.store.load_state(strategy) {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    strategy,
                    error = %e,
                    "⚠️ [SCHEDULE] Unreadable rebalance state, treating as first run"
                );
                None
            }
        }
    }

    /// True when there is no prior state or today has reached the next date.
    pub fn should_rebalance(&self, strategy: &str) -> bool {
        match self.load(strategy) {
            None => {
                debug!(strategy, "No prior rebalance state");
                true
            }
            Some(state) => {
                let due = self.today >= state.next_rebalance_date;
                debug!(
                    strategy,
                    next = %state.next_rebalance_date,
                    today = %self.today,
                    due,
                    "Rebalance schedule checked"
                );
                due
            }
        }
    }

    /// Weights from the last recorded rebalance; empty when none.
    pub fn current_weights(&self, strategy: &str) -> Weights {
        self.load(strategy)
            .map(|s| s.current_weights)
            .unwrap_or_default()
    }

    /// Record today's weights and schedule the next rebalance.
    pub fn record_rebalance(&self, strategy: &StrategyConfig, weights: &Weights) -> Result<RebalanceState> {
        let mut history = self
            .load(&strategy.name)
            .map(|s| s.history)
            .unwrap_or_default();

        history.push_back(RebalanceHistoryEntry {
            date: self.today,
            weights: weights.clone(),
            instruments: weights.len(),
        });
        while history.len() > self.history_capacity {
            history.pop_front();
        }

        let state = RebalanceState {
            strategy_name: strategy.name.clone(),
            cadence_days: strategy.cadence_days,
            last_rebalance_date: Some(self.today),
            next_rebalance_date: self.today + Duration::days(strategy.cadence_days as i64),
            current_weights: weights.clone(),
            history,
        };
        self.store.save_state(&state)?;

        info!(
            strategy = %strategy.name,
            instruments = weights.len(),
            next = %state.next_rebalance_date,
            "📅 [SCHEDULE] Rebalance recorded"
        );
        Ok(state)
    }

    /// Make a strategy due today without touching its weights.
    ///
    /// A strategy without state is already due; nothing is written.
    pub fn force_rebalance_now(&self, strategy: &str) -> Result<Option<RebalanceState>> {
        let Some(mut state) = self.load(strategy) else {
            debug!(strategy, "No state to force, strategy is already due");
            return Ok(None);
        };
        state.next_rebalance_date = self.today;
        self.store.save_state(&state)?;
        info!(strategy, "📅 [SCHEDULE] Rebalance forced for today");
        Ok(Some(state))
    }

    /// Every persisted state.
    pub fn states(&self) -> Result<Vec<RebalanceState>> {
        self.store.load_all_states()
    }
}
