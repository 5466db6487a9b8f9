//! Merge per-strategy weights into one target portfolio.
//!
//! Every strategy starts from `total_capital * weight`. Capital that a
//! strategy cannot use (an empty flexible strategy, or the part of any
//! strategy above `max_strategy_share`) is pooled and handed to the active,
//! uncapped flexible strategies in proportion to their configured weights,
//! repeating until nothing is left to place or nobody can take more.

use super::registry::Weights;
use crate::config::StrategyConfig;
use crate::exchange::OrderSide;
use crate::market::Universe;
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, warn};

/// How a strategy took part in this cycle's allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    /// Has positions and holds capital
    Active,
    /// Flexible and empty; its capital went to other strategies
    Empty,
    /// Non-flexible and empty; its capital sits unused
    Idle,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationReport {
    pub strategy: String,
    /// `total_capital * weight`
    pub nominal: Decimal,
    /// Capital the strategy actually trades with
    pub realized: Decimal,
    /// Capital received from other strategies
    pub reallocated_in: Decimal,
    /// Capital removed by the share cap
    pub clamped_out: Decimal,
    pub status: AllocationStatus,
}

/// One aggregated target position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizedPosition {
    pub instrument: String,
    pub exchange_symbol: String,
    /// Signed USD notional
    pub notional: Decimal,
    pub side: OrderSide,
}

/// Instrument -> target notional. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetPortfolio {
    positions: BTreeMap<String, SizedPosition>,
}

impl TargetPortfolio {
    pub fn get(&self, instrument: &str) -> Option<&SizedPosition> {
        self.positions.get(instrument)
    }

    pub fn notional(&self, instrument: &str) -> Decimal {
        self.positions
            .get(instrument)
            .map(|p| p.notional)
            .unwrap_or_default()
    }

    pub fn positions(&self) -> impl Iterator<Item = &SizedPosition> {
        self.positions.values()
    }

    pub fn gross(&self) -> Decimal {
        self.positions.values().map(|p| p.notional.abs()).sum()
    }

    pub fn net(&self) -> Decimal {
        self.positions.values().map(|p| p.notional).sum()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Drop instruments that must not be traded this cycle.
    pub fn remove(&mut self, instrument: &str) -> Option<SizedPosition> {
        self.positions.remove(instrument)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub target: TargetPortfolio,
    pub allocations: Vec<AllocationReport>,
    /// Capital no strategy could use
    pub idle_capital: Decimal,
}

#[derive(Debug, Clone)]
pub struct SignalAggregator {
    max_strategy_share: Decimal,
}

impl SignalAggregator {
    pub fn new(max_strategy_share: Decimal) -> Self {
        Self { max_strategy_share }
    }

    /// Combine sized weights into a target portfolio.
    ///
    /// `signals` maps strategy name to its sized weights; a missing or
    /// all-zero entry is an empty strategy. Instruments missing from
    /// `universe` trade under their own name as symbol.
    pub fn aggregate(
        &self,
        strategies: &[StrategyConfig],
        signals: &HashMap<String, Weights>,
        total_capital: Decimal,
        universe: &Universe,
    ) -> Aggregation {
        // Name order keeps the arithmetic independent of configuration order
        let mut ordered: Vec<&StrategyConfig> = strategies.iter().collect();
        ordered.sort_by(|a, b| a.name.cmp(&b.name));

        let cap = total_capital * self.max_strategy_share;
        let mut reports: Vec<AllocationReport> = Vec::with_capacity(ordered.len());
        let mut pool = Decimal::ZERO;

        for strategy in &ordered {
            let nominal = total_capital * strategy.weight;
            let active = signals
                .get(&strategy.name)
                .is_some_and(|w| w.values().any(|v| !v.is_zero()));

            let (realized, clamped_out, status) = if active {
                let realized = nominal.min(cap);
                (realized, nominal - realized, AllocationStatus::Active)
            } else if strategy.flexible {
                pool += nominal;
                (Decimal::ZERO, Decimal::ZERO, AllocationStatus::Empty)
            } else {
                (Decimal::ZERO, Decimal::ZERO, AllocationStatus::Idle)
            };
            pool += clamped_out;

            if clamped_out > Decimal::ZERO {
                debug!(strategy = %strategy.name, %clamped_out, "Strategy share capped");
            }

            reports.push(AllocationReport {
                strategy: strategy.name.clone(),
                nominal,
                realized,
                reallocated_in: Decimal::ZERO,
                clamped_out,
                status,
            });
        }

        // Each pass either places the whole pool or caps at least one recipient
        for _ in 0..=ordered.len() {
            if pool <= Decimal::ZERO {
                break;
            }
            let recipients: Vec<usize> = (0..ordered.len())
                .filter(|&i| {
                    ordered[i].flexible
                        && reports[i].status == AllocationStatus::Active
                        && reports[i].realized < cap
                })
                .collect();
            let weight_sum: Decimal = recipients.iter().map(|&i| ordered[i].weight).sum();
            if recipients.is_empty() || weight_sum <= Decimal::ZERO {
                break;
            }

            let mut overflow = Decimal::ZERO;
            for &i in &recipients {
                let share = pool * ordered[i].weight / weight_sum;
                let room = cap - reports[i].realized;
                let taken = share.min(room);
                reports[i].realized += taken;
                reports[i].reallocated_in += taken;
                overflow += share - taken;
            }
            pool = overflow;
        }

        let realized_total: Decimal = reports.iter().map(|r| r.realized).sum();
        let idle_capital = (total_capital - realized_total).max(Decimal::ZERO);
        if pool > Decimal::ZERO {
            warn!(unplaced = %pool, "No flexible strategy can absorb freed capital");
        }

        let mut notionals: BTreeMap<String, Decimal> = BTreeMap::new();
        for (strategy, report) in ordered.iter().zip(&reports) {
            if report.status != AllocationStatus::Active {
                continue;
            }
            if let Some(weights) = signals.get(&strategy.name) {
                for (instrument, weight) in weights {
                    *notionals.entry(instrument.clone()).or_default() += report.realized * *weight;
                }
            }
        }

        let positions = notionals
            .into_iter()
            .filter(|(_, notional)| !notional.is_zero())
            .map(|(instrument, notional)| {
                let exchange_symbol = universe
                    .get(&instrument)
                    .map(|spec| spec.exchange_symbol.clone())
                    .unwrap_or_else(|| instrument.clone());
                let position = SizedPosition {
                    instrument: instrument.clone(),
                    exchange_symbol,
                    notional,
                    side: OrderSide::from_signed(notional),
                };
                (instrument, position)
            })
            .collect();
        let target = TargetPortfolio { positions };

        for report in &reports {
            info!(
                strategy = %report.strategy,
                status = ?report.status,
                nominal = %report.nominal.round_dp(2),
                realized = %report.realized.round_dp(2),
                reallocated_in = %report.reallocated_in.round_dp(2),
                "💰 [ALLOCATION] Strategy capital"
            );
        }
        info!(
            instruments = target.len(),
            gross = %target.gross().round_dp(2),
            net = %target.net().round_dp(2),
            idle = %idle_capital.round_dp(2),
            "🎯 [TARGET] Portfolio aggregated"
        );

        Aggregation {
            target,
            allocations: reports,
            idle_capital,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstrumentConfig, SizingMode};
    use rust_decimal_macros::dec;

    fn strategy(name: &str, weight: Decimal, flexible: bool) -> StrategyConfig {
        StrategyConfig {
            name: name.to_string(),
            adapter: None,
            weight,
            flexible,
            cadence_days: 7,
            sizing: SizingMode::RiskParity,
            parameters: HashMap::new(),
        }
    }

    fn universe() -> Universe {
        let instruments: Vec<InstrumentConfig> = ["BTC", "ETH", "SOL"]
            .iter()
            .map(|i| InstrumentConfig {
                instrument: i.to_string(),
                exchange_symbol: None,
                tick_size: None,
                lot_size: None,
            })
            .collect();
        Universe::new(&instruments, "USDT", dec!(0.01), dec!(0.001))
    }

    fn weights(pairs: &[(&str, Decimal)]) -> Weights {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn report<'a>(agg: &'a Aggregation, name: &str) -> &'a AllocationReport {
        agg.allocations.iter().find(|r| r.strategy == name).unwrap()
    }

    #[test]
    fn test_empty_flexible_strategy_capital_moves() {
        let strategies = vec![strategy("a", dec!(0.1), true), strategy("b", dec!(0.1), true)];
        let signals = HashMap::from([
            ("a".to_string(), Weights::new()),
            ("b".to_string(), weights(&[("SOL", dec!(1.0))])),
        ]);

        let agg = SignalAggregator::new(dec!(0.5)).aggregate(&strategies, &signals, dec!(10000), &universe());

        assert_eq!(agg.target.notional("SOL"), dec!(2000));
        assert_eq!(agg.target.get("SOL").unwrap().exchange_symbol, "SOLUSDT");
        assert_eq!(report(&agg, "a").status, AllocationStatus::Empty);
        assert_eq!(report(&agg, "b").reallocated_in, dec!(1000));
    }

    #[test]
    fn test_reallocation_proportional_to_weights() {
        let strategies = vec![
            strategy("a", dec!(0.1), true),
            strategy("b", dec!(0.3), true),
            strategy("c", dec!(0.1), true),
        ];
        let signals = HashMap::from([
            ("b".to_string(), weights(&[("BTC", dec!(1))])),
            ("c".to_string(), weights(&[("ETH", dec!(1))])),
        ]);

        let agg = SignalAggregator::new(dec!(0.5)).aggregate(&strategies, &signals, dec!(1000), &universe());

        // a's 100 split 3:1
        assert_eq!(report(&agg, "b").realized, dec!(375));
        assert_eq!(report(&agg, "c").realized, dec!(125));
        assert_eq!(agg.target.gross(), dec!(500));
    }

    #[test]
    fn test_non_flexible_empty_capital_is_idle() {
        let strategies = vec![strategy("a", dec!(0.2), false), strategy("b", dec!(0.2), true)];
        let signals = HashMap::from([("b".to_string(), weights(&[("BTC", dec!(0.5))]))]);

        let agg = SignalAggregator::new(dec!(0.5)).aggregate(&strategies, &signals, dec!(1000), &universe());

        assert_eq!(report(&agg, "a").status, AllocationStatus::Idle);
        assert_eq!(report(&agg, "b").realized, dec!(200));
        assert_eq!(agg.idle_capital, dec!(800));
    }

    #[test]
    fn test_non_flexible_never_receives() {
        let strategies = vec![
            strategy("a", dec!(0.2), true),
            strategy("b", dec!(0.2), false),
            strategy("c", dec!(0.2), true),
        ];
        let signals = HashMap::from([
            ("b".to_string(), weights(&[("BTC", dec!(1))])),
            ("c".to_string(), weights(&[("ETH", dec!(1))])),
        ]);

        let agg = SignalAggregator::new(dec!(0.5)).aggregate(&strategies, &signals, dec!(1000), &universe());

        assert_eq!(report(&agg, "b").realized, dec!(200));
        assert_eq!(report(&agg, "c").realized, dec!(400));
    }

    #[test]
    fn test_cap_overflow_cascades() {
        let strategies = vec![
            strategy("a", dec!(0.6), true),
            strategy("b", dec!(0.3), true),
            strategy("c", dec!(0.1), true),
        ];
        let signals = HashMap::from([
            ("a".to_string(), weights(&[("BTC", dec!(1))])),
            ("b".to_string(), weights(&[("ETH", dec!(1))])),
            ("c".to_string(), weights(&[("SOL", dec!(1))])),
        ]);

        let agg = SignalAggregator::new(dec!(0.4)).aggregate(&strategies, &signals, dec!(1000), &universe());

        // a clamped 600 -> 400; 200 split 3:1 to b and c
        assert_eq!(report(&agg, "a").realized, dec!(400));
        assert_eq!(report(&agg, "a").clamped_out, dec!(200));
        assert_eq!(report(&agg, "b").realized, dec!(400));
        // b overflowed 50, which the next pass gives to c
        assert_eq!(report(&agg, "c").realized, dec!(200));
        assert_eq!(report(&agg, "c").reallocated_in, dec!(100));
        let total: Decimal = agg.allocations.iter().map(|r| r.realized).sum();
        assert!(total <= dec!(1000));
        assert_eq!(agg.idle_capital, Decimal::ZERO);
    }

    #[test]
    fn test_offsetting_notionals_are_summed_and_zeroes_dropped() {
        let strategies = vec![strategy("a", dec!(0.5), true), strategy("b", dec!(0.5), true)];
        let signals = HashMap::from([
            ("a".to_string(), weights(&[("BTC", dec!(0.5)), ("ETH", dec!(-0.5))])),
            ("b".to_string(), weights(&[("BTC", dec!(-0.5)), ("SOL", dec!(0.5))])),
        ]);

        let agg = SignalAggregator::new(dec!(0.5)).aggregate(&strategies, &signals, dec!(1000), &universe());

        assert!(agg.target.get("BTC").is_none());
        assert_eq!(agg.target.notional("ETH"), dec!(-250));
        assert_eq!(agg.target.get("ETH").unwrap().side, OrderSide::Sell);
        assert_eq!(agg.target.notional("SOL"), dec!(250));
    }

    #[test]
    fn test_order_independent() {
        let a = strategy("a", dec!(0.3), true);
        let b = strategy("b", dec!(0.2), true);
        let c = strategy("c", dec!(0.4), false);
        let signals = HashMap::from([
            ("a".to_string(), weights(&[("BTC", dec!(0.7)), ("ETH", dec!(-0.3))])),
            ("c".to_string(), weights(&[("SOL", dec!(1))])),
        ]);
        let aggregator = SignalAggregator::new(dec!(0.35));

        let first = aggregator.aggregate(&[a.clone(), b.clone(), c.clone()], &signals, dec!(5000), &universe());
        let second = aggregator.aggregate(&[c, a, b], &signals, dec!(5000), &universe());

        assert_eq!(first.target, second.target);
        assert_eq!(first.allocations, second.allocations);
    }
}
