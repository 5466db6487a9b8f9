//! Target vs live reconciliation.
//!
//! Produces the ordered list of trades that moves the live book to the target.
//! Live instruments with no target are always flattened; everything else is
//! traded only when the change is at least `rebalance_threshold` of equity.

use super::aggregator::TargetPortfolio;
use crate::exchange::OrderSide;
use crate::market::Universe;
use anyhow::{ensure, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

/// Live position read from the venue, keyed by research instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivePosition {
    pub instrument: String,
    pub exchange_symbol: String,
    /// Signed base quantity
    pub quantity: Decimal,
    pub mark_price: Decimal,
    /// Signed USD notional
    pub notional: Decimal,
    pub side: OrderSide,
}

impl LivePosition {
    /// Map a venue position through the universe; unknown symbols keep their
    /// venue symbol as instrument name.
    pub fn from_venue(position: &crate::exchange::Position, universe: &Universe) -> Self {
        let instrument = universe
            .instrument_for_symbol(&position.symbol)
            .unwrap_or(&position.symbol)
            .to_string();
        let notional = position.notional();
        Self {
            instrument,
            exchange_symbol: position.symbol.clone(),
            quantity: position.quantity,
            mark_price: position.mark_price,
            notional,
            side: OrderSide::from_signed(notional),
        }
    }
}

/// Why a trade is needed. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentKind {
    /// Flatten a position with no target
    Close,
    /// Shrink a position on the same side
    Reduce,
    /// Cross through zero to the other side
    Flip,
    /// Grow a position on the same side
    Increase,
    /// New position from flat
    Open,
}

impl IntentKind {
    /// Whether the trade lowers gross exposure on its own.
    pub fn reduces_exposure(&self) -> bool {
        matches!(self, IntentKind::Close | IntentKind::Reduce)
    }
}

/// One trade to execute this cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeIntent {
    pub instrument: String,
    pub exchange_symbol: String,
    pub side: OrderSide,
    /// Signed USD change, `target - live`
    pub delta_notional: Decimal,
    /// Price used to turn the notional into a quantity
    pub reference_price: Decimal,
    pub kind: IntentKind,
}

/// Intents grouped into sequential waves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub waves: Vec<Vec<TradeIntent>>,
}

impl ExecutionPlan {
    pub fn intents(&self) -> impl Iterator<Item = &TradeIntent> {
        self.waves.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(|w| w.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct DeltaCalculator {
    rebalance_threshold: Decimal,
    max_gross_leverage: Decimal,
}

impl DeltaCalculator {
    pub fn new(rebalance_threshold: Decimal, max_gross_leverage: Decimal) -> Self {
        Self {
            rebalance_threshold,
            max_gross_leverage,
        }
    }

    /// Diff `target` against `live`.
    ///
    /// `prices` supplies reference prices for instruments without a live
    /// position; instruments with no price at all are skipped.
    pub fn diff(
        &self,
        target: &TargetPortfolio,
        live: &[LivePosition],
        equity: Decimal,
        prices: &HashMap<String, Decimal>,
    ) -> Result<Vec<TradeIntent>> {
        ensure!(equity > Decimal::ZERO, "account equity must be positive, got {}", equity);

        let live_by_instrument: BTreeMap<&str, &LivePosition> = live
            .iter()
            .filter(|p| !p.notional.is_zero())
            .map(|p| (p.instrument.as_str(), p))
            .collect();

        let instruments: BTreeSet<&str> = target
            .positions()
            .map(|p| p.instrument.as_str())
            .chain(live_by_instrument.keys().copied())
            .collect();

        let mut intents = Vec::new();
        for instrument in instruments {
            let current = live_by_instrument.get(instrument).copied();
            let wanted = target.get(instrument);

            let live_notional = current.map(|p| p.notional).unwrap_or_default();
            let target_notional = wanted.map(|p| p.notional).unwrap_or_default();
            let delta = target_notional - live_notional;
            if delta.is_zero() {
                continue;
            }

            let kind = match (wanted, current) {
                (None, _) => IntentKind::Close,
                (Some(_), None) => IntentKind::Open,
                (Some(_), Some(_)) if (target_notional > Decimal::ZERO) != (live_notional > Decimal::ZERO) => {
                    IntentKind::Flip
                }
                (Some(_), Some(_)) if target_notional.abs() < live_notional.abs() => IntentKind::Reduce,
                (Some(_), Some(_)) => IntentKind::Increase,
            };

            // Neutralisation ignores the threshold
            if kind != IntentKind::Close && delta.abs() / equity < self.rebalance_threshold {
                debug!(
                    %instrument,
                    %delta,
                    fraction = %(delta.abs() / equity).round_dp(6),
                    "Delta below threshold, skipping"
                );
                continue;
            }

            let reference_price = current
                .map(|p| p.mark_price)
                .filter(|p| *p > Decimal::ZERO)
                .or_else(|| prices.get(instrument).copied());
            let Some(reference_price) = reference_price else {
                warn!(%instrument, "No reference price, cannot size trade");
                continue;
            };

            let exchange_symbol = wanted
                .map(|p| p.exchange_symbol.clone())
                .or_else(|| current.map(|p| p.exchange_symbol.clone()))
                .unwrap_or_else(|| instrument.to_string());

            intents.push(TradeIntent {
                instrument: instrument.to_string(),
                exchange_symbol,
                side: OrderSide::from_signed(delta),
                delta_notional: delta,
                reference_price,
                kind,
            });
        }

        intents.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.instrument.cmp(&b.instrument)));

        for intent in &intents {
            info!(
                instrument = %intent.instrument,
                kind = ?intent.kind,
                side = %intent.side,
                delta = %intent.delta_notional.round_dp(2),
                "📝 [DELTA] Trade intent"
            );
        }

        Ok(intents)
    }

    /// Group intents into waves.
    ///
    /// If executing everything at once could push gross exposure above
    /// `max_gross_leverage * equity`, exposure-reducing intents run first in
    /// their own wave.
    pub fn plan(&self, intents: Vec<TradeIntent>, live: &[LivePosition], equity: Decimal) -> ExecutionPlan {
        if intents.is_empty() {
            return ExecutionPlan::default();
        }

        let live_by_instrument: HashMap<&str, Decimal> = live
            .iter()
            .map(|p| (p.instrument.as_str(), p.notional))
            .collect();

        // Worst case: every addition lands before any reduction
        let touched: BTreeSet<&str> = intents.iter().map(|i| i.instrument.as_str()).collect();
        let untouched_gross: Decimal = live
            .iter()
            .filter(|p| !touched.contains(p.instrument.as_str()))
            .map(|p| p.notional.abs())
            .sum();
        let peak_gross: Decimal = untouched_gross
            + intents
                .iter()
                .map(|i| {
                    let before = live_by_instrument.get(i.instrument.as_str()).copied().unwrap_or_default();
                    let after = before + i.delta_notional;
                    before.abs().max(after.abs())
                })
                .sum::<Decimal>();

        let limit = self.max_gross_leverage * equity;
        if peak_gross <= limit {
            return ExecutionPlan { waves: vec![intents] };
        }

        let (reducing, adding): (Vec<TradeIntent>, Vec<TradeIntent>) =
            intents.into_iter().partition(|i| i.kind.reduces_exposure());
        info!(
            peak_gross = %peak_gross.round_dp(2),
            %limit,
            reducing = reducing.len(),
            adding = adding.len(),
            "🌊 [PLAN] Splitting execution into reduce-first waves"
        );

        ExecutionPlan {
            waves: [reducing, adding].into_iter().filter(|w| !w.is_empty()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InstrumentConfig, SizingMode, StrategyConfig};
    use crate::strategy::{SignalAggregator, Weights};
    use rust_decimal_macros::dec;

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

    /// Target built through the aggregator from one full-weight strategy.
    fn target(pairs: &[(&str, Decimal)]) -> TargetPortfolio {
        let strategy = StrategyConfig {
            name: "s".to_string(),
            adapter: None,
            weight: dec!(1),
            flexible: true,
            cadence_days: 1,
            sizing: SizingMode::AsIs,
            parameters: HashMap::new(),
        };
        let capital = dec!(10000);
        let weights: Weights = pairs.iter().map(|(k, v)| (k.to_string(), *v / capital)).collect();
        let signals = HashMap::from([("s".to_string(), weights)]);
        SignalAggregator::new(dec!(1))
            .aggregate(&[strategy], &signals, capital, &universe())
            .target
    }

    fn live(instrument: &str, notional: Decimal, price: Decimal) -> LivePosition {
        LivePosition {
            instrument: instrument.to_string(),
            exchange_symbol: format!("{}USDT", instrument),
            quantity: notional / price,
            mark_price: price,
            notional,
            side: OrderSide::from_signed(notional),
        }
    }

    fn calc() -> DeltaCalculator {
        DeltaCalculator::new(dec!(0.01), dec!(2))
    }

    #[test]
    fn test_small_delta_is_suppressed() {
        let intents = calc()
            .diff(
                &target(&[("BTC", dec!(1050))]),
                &[live("BTC", dec!(1000), dec!(50000))],
                dec!(10000),
                &HashMap::new(),
            )
            .unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn test_missing_target_closes_position() {
        let intents = calc()
            .diff(
                &TargetPortfolio::default(),
                &[live("ETH", dec!(500), dec!(2500))],
                dec!(10000),
                &HashMap::new(),
            )
            .unwrap();

        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].instrument, "ETH");
        assert_eq!(intents[0].side, OrderSide::Sell);
        assert_eq!(intents[0].delta_notional, dec!(-500));
        assert_eq!(intents[0].kind, IntentKind::Close);
    }

    #[test]
    fn test_tiny_position_without_target_still_closes() {
        let intents = calc()
            .diff(
                &TargetPortfolio::default(),
                &[live("SOL", dec!(-5), dec!(100))],
                dec!(10000),
                &HashMap::new(),
            )
            .unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0].delta_notional, dec!(5));
        assert_eq!(intents[0].side, OrderSide::Buy);
    }

    #[test]
    fn test_intents_ordered_closes_first() {
        let prices = HashMap::from([("SOL".to_string(), dec!(100))]);
        let intents = calc()
            .diff(
                &target(&[("BTC", dec!(-2000)), ("ETH", dec!(3000)), ("SOL", dec!(1000))]),
                &[
                    live("BTC", dec!(1000), dec!(50000)),
                    live("ETH", dec!(1000), dec!(2500)),
                    live("XRP", dec!(800), dec!(0.5)),
                ],
                dec!(10000),
                &prices,
            )
            .unwrap();

        let kinds: Vec<(String, IntentKind)> = intents
            .iter()
            .map(|i| (i.instrument.clone(), i.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                ("XRP".to_string(), IntentKind::Close),
                ("BTC".to_string(), IntentKind::Flip),
                ("ETH".to_string(), IntentKind::Increase),
                ("SOL".to_string(), IntentKind::Open),
            ]
        );
        assert_eq!(intents[1].delta_notional, dec!(-3000));
        assert_eq!(intents[3].reference_price, dec!(100));
        assert_eq!(intents[3].exchange_symbol, "SOLUSDT");
    }

    #[test]
    fn test_open_without_price_is_skipped() {
        let intents = calc()
            .diff(&target(&[("SOL", dec!(1000))]), &[], dec!(10000), &HashMap::new())
            .unwrap();
        assert!(intents.is_empty());
    }

    #[test]
    fn test_non_positive_equity_rejected() {
        let result = calc().diff(&TargetPortfolio::default(), &[], Decimal::ZERO, &HashMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn test_plan_single_wave_within_leverage() {
        let live_positions = [live("BTC", dec!(1000), dec!(50000))];
        let intents = calc()
            .diff(
                &target(&[("ETH", dec!(2000))]),
                &live_positions,
                dec!(10000),
                &HashMap::from([("ETH".to_string(), dec!(2500))]),
            )
            .unwrap();

        let plan = calc().plan(intents, &live_positions, dec!(10000));
        assert_eq!(plan.waves.len(), 1);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn test_plan_reduces_first_when_over_leverage() {
        let live_positions = [live("BTC", dec!(15000), dec!(50000))];
        let intents = calc()
            .diff(
                &target(&[("ETH", dec!(15000))]),
                &live_positions,
                dec!(10000),
                &HashMap::from([("ETH".to_string(), dec!(2500))]),
            )
            .unwrap();

        // Rotating 15k BTC into 15k ETH peaks at 30k gross against a 20k limit
        let plan = calc().plan(intents, &live_positions, dec!(10000));
        assert_eq!(plan.waves.len(), 2);
        assert_eq!(plan.waves[0][0].instrument, "BTC");
        assert_eq!(plan.waves[1][0].instrument, "ETH");
    }
}
