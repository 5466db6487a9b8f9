//! One rebalance pass.
//!
//! Scheduler -> strategy adapters -> sizer -> aggregator -> delta calculator
//! -> execution engine -> schedule update. Strategies and aggregation run
//! sequentially; only order execution fans out.

use crate::config::{Config, StrategyConfig};
use crate::exchange::{with_retry, Exchange, RetryPolicy};
use crate::execution::{ExecutionEngine, ExecutionSettings, IntentOutcome, TradeRecord};
use crate::market::{MarketData, Universe};
use crate::risk::{Alert, FreshnessGuard};
use crate::strategy::{
    AllocationReport, DeltaCalculator, LivePosition, PositionSizer, RebalanceScheduler, ScheduleStore,
    SignalAggregator, StrategyRegistry, TargetPortfolio, TradeIntent, Weights,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Per-run switches.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    /// Calendar date the scheduler and data cut-off use
    pub today: NaiveDate,
    /// Reference time for data freshness
    pub now: DateTime<Utc>,
    /// Simulate orders and leave the schedule untouched
    pub dry_run: bool,
    /// Treat every strategy as due
    pub force_all: bool,
    /// Treat these strategies as due
    pub forced: HashSet<String>,
}

impl CycleOptions {
    /// Options for a run as of the current wall clock.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            today: now.date_naive(),
            now,
            dry_run: false,
            force_all: false,
            forced: HashSet::new(),
        }
    }

    /// Options for a run pinned to `date`, freshness measured from its midnight.
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            today: date,
            now: Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN)),
            dry_run: false,
            force_all: false,
            forced: HashSet::new(),
        }
    }

    pub fn is_forced(&self, strategy: &str) -> bool {
        self.force_all || self.forced.contains(strategy)
    }
}

/// What happened to one strategy this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyRun {
    pub strategy: String,
    /// Recomputed this cycle (scheduled or forced)
    pub due: bool,
    /// Adapter missing or failed; contributed nothing
    pub failed: bool,
    /// Instruments with a non-zero weight
    pub instruments: usize,
}

/// Everything one pass did, for the operator summary and the exit code.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub date: NaiveDate,
    pub equity: Decimal,
    pub strategies: Vec<StrategyRun>,
    pub allocations: Vec<AllocationReport>,
    pub idle_capital: Decimal,
    pub target: TargetPortfolio,
    pub intents: Vec<TradeIntent>,
    pub outcomes: Vec<IntentOutcome>,
    pub trades: Vec<TradeRecord>,
    /// Strategies whose rebalance was persisted
    pub recorded: Vec<String>,
    pub alerts: Vec<Alert>,
    pub halted: bool,
}

impl CycleReport {
    fn new(date: NaiveDate) -> Self {
        Self {
            date,
            equity: Decimal::ZERO,
            strategies: Vec::new(),
            allocations: Vec::new(),
            idle_capital: Decimal::ZERO,
            target: TargetPortfolio::default(),
            intents: Vec::new(),
            outcomes: Vec::new(),
            trades: Vec::new(),
            recorded: Vec::new(),
            alerts: Vec::new(),
            halted: false,
        }
    }

    pub fn abandoned(&self) -> impl Iterator<Item = &IntentOutcome> {
        self.outcomes.iter().filter(|o| o.is_abandoned())
    }

    /// 0 success, 1 some intent abandoned, 2 halted on stale data.
    pub fn exit_code(&self) -> i32 {
        if self.halted {
            2
        } else if self.abandoned().next().is_some() {
            1
        } else {
            0
        }
    }
}

/// Venue prices keyed by exchange symbol, from each instrument's latest close.
pub fn symbol_prices(data: &MarketData, universe: &Universe) -> HashMap<String, Decimal> {
    data.latest_closes()
        .into_iter()
        .filter_map(|(instrument, close)| {
            universe
                .get(&instrument)
                .map(|spec| (spec.exchange_symbol.clone(), close))
        })
        .collect()
}

pub struct RebalanceCycle<'a, S> {
    config: &'a Config,
    registry: &'a StrategyRegistry,
    universe: &'a Universe,
    exchange: Arc<dyn Exchange>,
    scheduler: RebalanceScheduler<S>,
    options: CycleOptions,
}

impl<'a, S: ScheduleStore> RebalanceCycle<'a, S> {
    pub fn new(
        config: &'a Config,
        registry: &'a StrategyRegistry,
        universe: &'a Universe,
        exchange: Arc<dyn Exchange>,
        store: S,
        options: CycleOptions,
    ) -> Self {
        let scheduler = RebalanceScheduler::new(store, options.today, config.persistence.history_capacity);
        Self {
            config,
            registry,
            universe,
            exchange,
            scheduler,
            options,
        }
    }

    pub fn scheduler(&self) -> &RebalanceScheduler<S> {
        &self.scheduler
    }

    /// Run one pass over `data`.
    ///
    /// Errors only when the venue cannot report equity or positions, or the
    /// equity is not positive; everything else degrades into the report.
    pub async fn run(&self, data: &MarketData) -> Result<CycleReport> {
        let today = self.options.today;
        let mut report = CycleReport::new(today);

        info!(
            %today,
            dry_run = self.options.dry_run,
            venue = self.exchange.name(),
            strategies = self.config.strategies.len(),
            "🔄 [CYCLE] Starting rebalance cycle"
        );

        // Only this universe, nothing from the future
        let outside: Vec<String> = data
            .instruments()
            .into_iter()
            .filter(|instrument| !self.universe.contains(instrument))
            .collect();
        let data = data.as_of(today).without(&outside);

        let staleness = FreshnessGuard::new(&self.config.data).check(&data, self.options.now);
        report.alerts.extend(staleness.alerts.iter().cloned());
        if staleness.should_halt() {
            error!(%today, "🛑 [CYCLE] No usable market data, halting before any order");
            report
                .alerts
                .push(Alert::cycle_halted(format!("no usable market data as of {}", today)));
            report.halted = true;
            Self::emit_alerts(&report);
            return Ok(report);
        }
        let excluded = staleness.excluded_instruments();
        let data = data.without(&excluded);

        let retry = RetryPolicy::from_config(&self.config.retry);
        let exchange = &self.exchange;
        let equity = with_retry(&retry, "get_account_equity", || exchange.get_account_equity())
            .await
            .context("Failed to read account equity")?;
        report.equity = equity;
        info!(%equity, "💰 [CYCLE] Account equity");

        let (signals, to_record) = self.compute_signals(&data, equity, &mut report);

        let aggregation = SignalAggregator::new(self.config.portfolio.max_strategy_share).aggregate(
            &self.config.strategies,
            &signals,
            equity,
            self.universe,
        );
        let mut target = aggregation.target;
        for instrument in &excluded {
            if target.remove(instrument).is_some() {
                warn!(%instrument, "Stale instrument removed from target");
            }
        }
        report.allocations = aggregation.allocations;
        report.idle_capital = aggregation.idle_capital;
        info!(
            instruments = target.len(),
            gross = %target.gross().round_dp(2),
            net = %target.net().round_dp(2),
            idle = %report.idle_capital.round_dp(2),
            "🎯 [CYCLE] Target portfolio"
        );

        let positions = with_retry(&retry, "get_positions", || exchange.get_positions())
            .await
            .context("Failed to read live positions")?;
        let live: Vec<LivePosition> = positions
            .iter()
            .map(|p| LivePosition::from_venue(p, self.universe))
            .filter(|p| {
                let keep = !excluded.contains(&p.instrument);
                if !keep {
                    warn!(instrument = %p.instrument, "Holding stale instrument untouched this cycle");
                }
                keep
            })
            .collect();

        let calculator = DeltaCalculator::new(
            self.config.portfolio.rebalance_threshold,
            self.config.portfolio.max_gross_leverage,
        );
        let intents = calculator.diff(&target, &live, equity, &data.latest_closes())?;
        let plan = calculator.plan(intents, &live, equity);
        report.intents = plan.intents().cloned().collect();
        report.target = target;

        if plan.is_empty() {
            info!("✅ [CYCLE] Portfolio within threshold, nothing to trade");
        } else {
            let engine = ExecutionEngine::new(
                Arc::clone(&self.exchange),
                ExecutionSettings::from_config(&self.config.execution),
                retry,
            );
            let (tx, mut rx) = mpsc::unbounded_channel();
            report.outcomes = engine.execute(&plan, self.universe, tx).await;
            while let Ok(trade) = rx.try_recv() {
                report.trades.push(trade);
            }
        }

        for outcome in report.outcomes.iter().filter(|o| o.is_abandoned()) {
            report.alerts.push(Alert::intent_abandoned(
                &outcome.intent.instrument,
                outcome.reason.clone().unwrap_or_else(|| "unknown".to_string()),
            ));
        }

        if self.options.dry_run {
            info!("🧪 [DRY RUN] Schedule state left untouched");
        } else {
            for (strategy, weights) in to_record {
                match self.scheduler.record_rebalance(strategy, &weights) {
                    Ok(_) => report.recorded.push(strategy.name.clone()),
                    Err(e) => error!(strategy = %strategy.name, error = %e, "Failed to record rebalance"),
                }
            }
        }

        Self::emit_alerts(&report);
        info!(
            intents = report.intents.len(),
            trades = report.trades.len(),
            abandoned = report.abandoned().count(),
            "🏁 [CYCLE] Rebalance cycle complete"
        );
        Ok(report)
    }

    /// Sized weights per strategy, plus the strategies whose fresh result
    /// should be recorded once the cycle completes.
    fn compute_signals(
        &self,
        data: &MarketData,
        equity: Decimal,
        report: &mut CycleReport,
    ) -> (HashMap<String, Weights>, Vec<(&'a StrategyConfig, Weights)>) {
        let sizer = PositionSizer::new(&self.config.sizing);
        let mut signals = HashMap::new();
        let mut to_record = Vec::new();
        let config = self.config;

        for strategy in &config.strategies {
            let forced = self.options.is_forced(&strategy.name);
            if !forced && !self.scheduler.should_rebalance(&strategy.name) {
                let cached = self.scheduler.current_weights(&strategy.name);
                debug!(strategy = %strategy.name, instruments = cached.len(), "Not due, reusing cached weights");
                report.strategies.push(StrategyRun {
                    strategy: strategy.name.clone(),
                    due: false,
                    failed: false,
                    instruments: count_nonzero(&cached),
                });
                signals.insert(strategy.name.clone(), cached);
                continue;
            }

            let computed = self
                .registry
                .get(strategy.adapter_name())
                .with_context(|| format!("unknown adapter {}", strategy.adapter_name()))
                .and_then(|adapter| adapter.compute(data, equity * strategy.weight, &strategy.parameters));

            let weights = match computed {
                Ok(signal) => {
                    let sized = sizer.apply(strategy.sizing, &signal, data);
                    for dropped in &sized.dropped {
                        debug!(strategy = %strategy.name, reason = %dropped, "Instrument dropped by sizer");
                    }
                    info!(
                        strategy = %strategy.name,
                        forced,
                        longs = signal.longs().len(),
                        shorts = signal.shorts().len(),
                        sized = sized.weights.len(),
                        "📊 [STRATEGY] Signal computed"
                    );
                    to_record.push((strategy, sized.weights.clone()));
                    sized.weights
                }
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(strategy = %strategy.name, error = %message, "❌ [STRATEGY] Adapter failed");
                    report.alerts.push(Alert::strategy_failed(&strategy.name, message));
                    report.strategies.push(StrategyRun {
                        strategy: strategy.name.clone(),
                        due: true,
                        failed: true,
                        instruments: 0,
                    });
                    signals.insert(strategy.name.clone(), Weights::new());
                    continue;
                }
            };

            report.strategies.push(StrategyRun {
                strategy: strategy.name.clone(),
                due: true,
                failed: false,
                instruments: count_nonzero(&weights),
            });
            signals.insert(strategy.name.clone(), weights);
        }

        (signals, to_record)
    }

    fn emit_alerts(report: &CycleReport) {
        for alert in &report.alerts {
            alert.emit();
        }
    }
}

fn count_nonzero(weights: &Weights) -> usize {
    weights.values().filter(|w| !w.is_zero()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExecutionMode, InstrumentConfig, PaperConfig, SizingMode};
    use crate::exchange::{DryRunExchange, PaperExchange, PaperPosition, PaperSnapshot};
    use crate::execution::FinalState;
    use crate::market::Candle;
    use crate::persistence::PersistenceManager;
    use crate::risk::AlertKind;
    use crate::strategy::{IntentKind, RebalanceState, Signal, StrategyAdapter, StrategyParams};
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use serde_json::json;
    use std::collections::VecDeque;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn candles(instrument: &str, close: Decimal, last_day: NaiveDate) -> Vec<(String, Candle)> {
        (0..10)
            .map(|i| {
                let day = last_day - Duration::days(9 - i);
                let timestamp = Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap());
                (
                    instrument.to_string(),
                    Candle {
                        timestamp,
                        open: close,
                        high: close,
                        low: close,
                        close,
                        volume: dec!(1),
                    },
                )
            })
            .collect()
    }

    fn market(eth_last_day: NaiveDate) -> MarketData {
        let mut all = candles("BTC", dec!(50000), today());
        all.extend(candles("ETH", dec!(2500), eth_last_day));
        MarketData::from_candles(all)
    }

    fn strategy(name: &str, adapter: &str, weight: Decimal, params: serde_json::Value) -> StrategyConfig {
        StrategyConfig {
            name: name.to_string(),
            adapter: Some(adapter.to_string()),
            weight,
            flexible: true,
            cadence_days: 7,
            sizing: SizingMode::AsIs,
            parameters: serde_json::from_value(params).unwrap(),
        }
    }

    fn config(strategies: Vec<StrategyConfig>) -> Config {
        let mut config = Config {
            universe: vec![
                InstrumentConfig {
                    instrument: "BTC".to_string(),
                    exchange_symbol: None,
                    tick_size: Some(dec!(0.1)),
                    lot_size: Some(dec!(0.001)),
                },
                InstrumentConfig {
                    instrument: "ETH".to_string(),
                    exchange_symbol: None,
                    tick_size: Some(dec!(0.01)),
                    lot_size: Some(dec!(0.01)),
                },
            ],
            strategies,
            ..Config::default()
        };
        config.execution.mode = ExecutionMode::Simple;
        config.retry.base_delay_ms = 1;
        config
    }

    fn core() -> StrategyConfig {
        strategy("core", "static_weights", dec!(0.5), json!({"weights": {"BTC": 0.5, "ETH": -0.5}}))
    }

    async fn paper() -> Arc<PaperExchange> {
        let exchange = Arc::new(PaperExchange::new(&PaperConfig {
            initial_balance: dec!(10000),
            spread_bps: Decimal::ZERO,
            fee_rate: Decimal::ZERO,
            resting_fill_fraction: Decimal::ZERO,
        }));
        exchange.set_price("BTCUSDT", dec!(50000)).await;
        exchange.set_price("ETHUSDT", dec!(2500)).await;
        exchange
    }

    struct FailingAdapter;

    impl StrategyAdapter for FailingAdapter {
        fn compute(&self, _data: &MarketData, _capital: Decimal, _params: &StrategyParams) -> Result<Signal> {
            anyhow::bail!("factor file missing")
        }
    }

    #[tokio::test]
    async fn test_first_run_trades_and_records_schedule() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        let exchange = paper().await;

        let cycle = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            exchange.clone(),
            &store,
            CycleOptions::for_date(today()),
        );
        let report = cycle.run(&market(today())).await.unwrap();

        assert!(!report.halted);
        assert_eq!(report.equity, dec!(10000));
        assert_eq!(report.target.notional("BTC"), dec!(2500));
        assert_eq!(report.target.notional("ETH"), dec!(-2500));
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.final_state == FinalState::Filled));
        assert_eq!(report.trades.len(), 2);
        assert_eq!(report.recorded, vec!["core".to_string()]);
        assert_eq!(report.exit_code(), 0);

        let mut positions = exchange.get_positions().await.unwrap();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        assert_eq!(positions[0].symbol, "BTCUSDT");
        assert_eq!(positions[0].quantity, dec!(0.05));
        assert_eq!(positions[1].quantity, dec!(-1));

        let state = store.load_state("core").unwrap().unwrap();
        assert_eq!(state.last_rebalance_date, Some(today()));
        assert_eq!(state.next_rebalance_date, today() + Duration::days(7));
    }

    #[tokio::test]
    async fn test_second_run_same_day_is_idempotent() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        let exchange = paper().await;

        for _ in 0..2 {
            RebalanceCycle::new(
                &config,
                &registry,
                &universe,
                exchange.clone(),
                &store,
                CycleOptions::for_date(today()),
            )
            .run(&market(today()))
            .await
            .unwrap();
        }

        let report = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            exchange.clone(),
            &store,
            CycleOptions::for_date(today()),
        )
        .run(&market(today()))
        .await
        .unwrap();

        assert!(report.intents.is_empty());
        assert!(report.recorded.is_empty());
        assert!(!report.strategies[0].due);
    }

    #[tokio::test]
    async fn test_not_due_strategy_keeps_cached_weights() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        store
            .save_state(&RebalanceState {
                strategy_name: "core".to_string(),
                cadence_days: 7,
                last_rebalance_date: Some(today() - Duration::days(4)),
                next_rebalance_date: today() + Duration::days(3),
                current_weights: Weights::from([("BTC".to_string(), dec!(0.2))]),
                history: VecDeque::new(),
            })
            .unwrap();
        let exchange = paper().await;

        let report = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            exchange,
            &store,
            CycleOptions::for_date(today()),
        )
        .run(&market(today()))
        .await
        .unwrap();

        assert_eq!(report.target.notional("BTC"), dec!(1000));
        assert!(report.target.get("ETH").is_none());
        assert_eq!(report.intents.len(), 1);
        assert!(report.recorded.is_empty());
        let state = store.load_state("core").unwrap().unwrap();
        assert_eq!(state.next_rebalance_date, today() + Duration::days(3));
    }

    #[tokio::test]
    async fn test_forced_strategy_recomputes_before_due_date() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        store
            .save_state(&RebalanceState {
                strategy_name: "core".to_string(),
                cadence_days: 7,
                last_rebalance_date: Some(today() - Duration::days(4)),
                next_rebalance_date: today() + Duration::days(3),
                current_weights: Weights::from([("BTC".to_string(), dec!(0.2))]),
                history: VecDeque::new(),
            })
            .unwrap();

        let mut options = CycleOptions::for_date(today());
        options.forced.insert("core".to_string());
        let report = RebalanceCycle::new(&config, &registry, &universe, paper().await, &store, options)
            .run(&market(today()))
            .await
            .unwrap();

        assert!(report.strategies[0].due);
        assert_eq!(report.target.notional("ETH"), dec!(-2500));
        let state = store.load_state("core").unwrap().unwrap();
        assert_eq!(state.next_rebalance_date, today() + Duration::days(7));
    }

    #[tokio::test]
    async fn test_failing_adapter_is_empty_and_not_recorded() {
        let config = config(vec![core(), strategy("broken", "broken", dec!(0.3), json!({}))]);
        let universe = Universe::from_config(&config);
        let mut registry = StrategyRegistry::with_builtins();
        registry.register("broken", Arc::new(FailingAdapter));
        let store = PersistenceManager::new(":memory:").unwrap();

        let report = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            paper().await,
            &store,
            CycleOptions::for_date(today()),
        )
        .run(&market(today()))
        .await
        .unwrap();

        assert_eq!(report.recorded, vec!["core".to_string()]);
        assert!(report
            .alerts
            .iter()
            .any(|a| matches!(&a.kind, AlertKind::StrategyFailed { strategy, .. } if strategy == "broken")));
        let broken = report.strategies.iter().find(|s| s.strategy == "broken").unwrap();
        assert!(broken.failed);
        assert!(store.load_state("broken").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_instrument_excluded_from_trading() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        let exchange = paper().await;
        exchange
            .restore_state(PaperSnapshot {
                balance: dec!(10000),
                positions: vec![PaperPosition {
                    symbol: "ETHUSDT".to_string(),
                    quantity: dec!(-1),
                    avg_entry_price: dec!(2500),
                }],
                total_fees: Decimal::ZERO,
                order_count: 0,
            })
            .await;

        let report = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            exchange.clone(),
            &store,
            CycleOptions::for_date(today()),
        )
        .run(&market(today() - Duration::days(5)))
        .await
        .unwrap();

        assert!(!report.halted);
        assert!(report.target.get("ETH").is_none());
        assert!(report.intents.iter().all(|i| i.instrument == "BTC"));
        assert!(report
            .alerts
            .iter()
            .any(|a| matches!(&a.kind, AlertKind::CriticalStaleData { instrument, .. } if instrument == "ETH")));

        let eth = exchange
            .get_positions()
            .await
            .unwrap()
            .into_iter()
            .find(|p| p.symbol == "ETHUSDT")
            .unwrap();
        assert_eq!(eth.quantity, dec!(-1));
    }

    #[test]
    fn test_all_stale_halts_before_any_order() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        let exchange = Arc::new(PaperExchange::new(&config.paper));

        let stale_day = today() - Duration::days(9);
        let mut data = candles("BTC", dec!(50000), stale_day);
        data.extend(candles("ETH", dec!(2500), stale_day));
        let data = MarketData::from_candles(data);

        let cycle = RebalanceCycle::new(
            &config,
            &registry,
            &universe,
            exchange,
            &store,
            CycleOptions::for_date(today()),
        );
        let report = tokio_test::block_on(cycle.run(&data));
        let report = tokio_test::assert_ok!(report);

        assert!(report.halted);
        assert_eq!(report.exit_code(), 2);
        assert!(report.intents.is_empty());
        assert!(report
            .alerts
            .iter()
            .any(|a| matches!(a.kind, AlertKind::CycleHalted { .. })));
        assert!(store.load_state("core").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dry_run_leaves_venue_and_schedule_alone() {
        let config = config(vec![core()]);
        let universe = Universe::from_config(&config);
        let registry = StrategyRegistry::with_builtins();
        let store = PersistenceManager::new(":memory:").unwrap();
        let paper = paper().await;
        let exchange = Arc::new(DryRunExchange::new(paper.clone()));

        let mut options = CycleOptions::for_date(today());
        options.dry_run = true;
        let report = RebalanceCycle::new(&config, &registry, &universe, exchange.clone(), &store, options)
            .run(&market(today()))
            .await
            .unwrap();

        assert_eq!(report.intents.len(), 2);
        assert!(report.outcomes.iter().all(|o| o.final_state == FinalState::Filled));
        assert_eq!(exchange.simulated_orders().len(), 2);
        assert!(report.recorded.is_empty());
        assert!(paper.get_positions().await.unwrap().is_empty());
        assert!(store.load_state("core").unwrap().is_none());
    }

    #[test]
    fn test_exit_code_reports_abandoned_intents() {
        let mut report = CycleReport::new(today());
        assert_eq!(report.exit_code(), 0);

        report.outcomes.push(IntentOutcome {
            intent: TradeIntent {
                instrument: "BTC".to_string(),
                exchange_symbol: "BTCUSDT".to_string(),
                side: crate::exchange::OrderSide::Buy,
                delta_notional: dec!(1000),
                reference_price: dec!(50000),
                kind: IntentKind::Open,
            },
            final_state: FinalState::Abandoned,
            reason: Some("insufficient margin".to_string()),
            requested_quantity: dec!(0.02),
            filled_quantity: Decimal::ZERO,
            average_price: None,
            phases: vec!["PENDING".to_string(), "ABANDONED".to_string()],
        });
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_symbol_prices_use_universe_symbols() {
        let config = config(Vec::new());
        let universe = Universe::from_config(&config);
        let prices = symbol_prices(&market(today()), &universe);
        assert_eq!(prices.get("BTCUSDT"), Some(&dec!(50000)));
        assert_eq!(prices.get("ETHUSDT"), Some(&dec!(2500)));
    }
}
