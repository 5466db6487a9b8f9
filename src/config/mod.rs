//! Configuration management for the multi-strategy rebalancer.
//!
//! Loads settings from an optional `config.toml` and `MSR__`-prefixed
//! environment variables, then validates them before any capital is touched.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Portfolio-wide rebalance knobs
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    /// Risk-parity sizing parameters
    #[serde(default)]
    pub sizing: SizingConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Retry policy applied to every exchange call
    #[serde(default)]
    pub retry: RetryConfig,
    /// Market data location and freshness thresholds
    #[serde(default)]
    pub data: DataConfig,
    /// Durable state location
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Paper exchange simulation settings
    #[serde(default)]
    pub paper: PaperConfig,
    /// Tradable instruments
    #[serde(default)]
    pub universe: Vec<InstrumentConfig>,
    /// Strategy definitions
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Minimum |delta| / equity before a trade is generated (0.01 = 1%)
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold: Decimal,
    /// Maximum realized share of total capital for any single strategy
    #[serde(default = "default_max_strategy_share")]
    pub max_strategy_share: Decimal,
    /// Gross exposure limit as a multiple of equity; above it closes run first
    #[serde(default = "default_max_gross_leverage")]
    pub max_gross_leverage: Decimal,
    /// Quote asset appended to instruments without an explicit exchange symbol
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Number of trailing daily returns used for realized volatility
    #[serde(default = "default_lookback_days")]
    pub lookback_days: usize,
    /// Minimum returns required before an instrument can be sized
    #[serde(default = "default_min_data_points")]
    pub min_data_points: usize,
    /// Fraction of strategy capital deployed on the long side
    #[serde(default = "default_side_fraction")]
    pub long_fraction: Decimal,
    /// Fraction of strategy capital deployed on the short side
    #[serde(default = "default_side_fraction")]
    pub short_fraction: Decimal,
}

/// How trade intents are turned into orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One market order per intent, fire-and-forget
    Simple,
    /// Limit at touch, walk the price, then cross the spread
    Aggressive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_mode")]
    pub mode: ExecutionMode,
    /// Log intended orders instead of sending them
    #[serde(default)]
    pub dry_run: bool,
    /// How long a posted limit order may rest before it is repriced
    #[serde(default = "default_limit_timeout_ms")]
    pub limit_timeout_ms: u64,
    /// Fill-status polling interval while a limit order rests
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Maximum number of cancel/repost iterations before crossing
    #[serde(default = "default_max_reprices")]
    pub max_reprices: u32,
    /// Fraction of the spread walked per reprice iteration
    #[serde(default = "default_reprice_step")]
    pub reprice_step: Decimal,
    /// Price increment used when an instrument has no explicit tick size
    #[serde(default = "default_tick_size")]
    pub default_tick_size: Decimal,
    /// Quantity increment used when an instrument has no explicit lot size
    #[serde(default = "default_lot_size")]
    pub default_lot_size: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: Decimal,
    /// Timeout applied to each individual exchange call
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// CSV file with `timestamp,instrument,open,high,low,close,volume` rows
    #[serde(default = "default_candles_path")]
    pub candles_path: String,
    /// Age of the newest candle that triggers a warning
    #[serde(default = "default_warn_after_hours")]
    pub warn_after_hours: u32,
    /// Age of the newest candle above which an instrument is not traded
    #[serde(default = "default_halt_after_hours")]
    pub halt_after_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Number of past rebalances kept per strategy
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting cash for a fresh paper account
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
    /// Full bid/ask spread around the last close, in basis points
    #[serde(default = "default_spread_bps")]
    pub spread_bps: Decimal,
    /// Taker fee charged on every simulated fill
    #[serde(default = "default_fee_rate")]
    pub fee_rate: Decimal,
    /// Fraction of a resting, non-crossing limit order filled per status poll
    #[serde(default)]
    pub resting_fill_fraction: Decimal,
}

/// One tradable instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Research-side name (e.g., "BTC")
    pub instrument: String,
    /// Venue symbol; defaults to instrument + quote asset
    #[serde(default)]
    pub exchange_symbol: Option<String>,
    #[serde(default)]
    pub tick_size: Option<Decimal>,
    #[serde(default)]
    pub lot_size: Option<Decimal>,
}

/// How a strategy's raw signal becomes weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    /// Inverse-volatility weighting of the selected instruments
    #[default]
    RiskParity,
    /// Use the adapter's weights directly
    AsIs,
}

/// Per-strategy configuration. Immutable for the duration of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    /// Registry key of the adapter; defaults to `name`
    #[serde(default)]
    pub adapter: Option<String>,
    /// Fraction of total capital (0.0-1.0)
    pub weight: Decimal,
    /// Whether unused capital may move to or from this strategy
    #[serde(default = "default_flexible")]
    pub flexible: bool,
    /// Days between signal recomputations
    #[serde(default = "default_cadence_days")]
    pub cadence_days: u32,
    #[serde(default)]
    pub sizing: SizingMode,
    /// Free-form adapter parameters
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl StrategyConfig {
    /// Registry key used to look up the adapter.
    pub fn adapter_name(&self) -> &str {
        self.adapter.as_deref().unwrap_or(&self.name)
    }
}

/// Configuration rejected at startup.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigValidationError {
    #[error("{field} = {value} is out of range ({expected})")]
    OutOfRange {
        field: String,
        value: Decimal,
        expected: &'static str,
    },
    #[error("strategy weights sum to {sum}, which exceeds 100% of capital")]
    WeightSumExceeded { sum: Decimal },
    #[error("duplicate strategy name: {0}")]
    DuplicateStrategy(String),
    #[error("strategy {strategy} references unknown adapter {adapter}")]
    UnknownAdapter { strategy: String, adapter: String },
    #[error("strategy {0} has a zero-day cadence")]
    ZeroCadence(String),
    #[error("no strategies configured")]
    NoStrategies,
    #[error("instrument universe is empty")]
    EmptyUniverse,
    #[error("{0}")]
    Invalid(String),
}

// Default value functions
fn default_rebalance_threshold() -> Decimal {
    Decimal::new(1, 2) // 0.01 = 1% of equity
}

fn default_max_strategy_share() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_max_gross_leverage() -> Decimal {
    Decimal::new(2, 0) // 2.0x equity
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_lookback_days() -> usize {
    30
}

fn default_min_data_points() -> usize {
    20
}

fn default_side_fraction() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_execution_mode() -> ExecutionMode {
    ExecutionMode::Aggressive
}

fn default_limit_timeout_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_reprices() -> u32 {
    3
}

fn default_reprice_step() -> Decimal {
    Decimal::new(25, 2) // 0.25 of the spread per iteration
}

fn default_tick_size() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_lot_size() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_backoff_multiplier() -> Decimal {
    Decimal::new(2, 0)
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_candles_path() -> String {
    "data/candles.csv".to_string()
}

fn default_warn_after_hours() -> u32 {
    36
}

fn default_halt_after_hours() -> u32 {
    72
}

fn default_db_path() -> String {
    "data/rebalancer.db".to_string()
}

fn default_history_capacity() -> usize {
    52 // one year of weekly rebalances
}

fn default_initial_balance() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_spread_bps() -> Decimal {
    Decimal::new(5, 0) // 5 bps
}

fn default_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004 (0.04% taker)
}

fn default_flexible() -> bool {
    true
}

fn default_cadence_days() -> u32 {
    7
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from a specific file stem (extension optional).
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__").prefix("MSR"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> std::result::Result<(), ConfigValidationError> {
        ensure_fraction(
            "portfolio.rebalance_threshold",
            self.portfolio.rebalance_threshold,
            false,
        )?;
        ensure_positive_fraction(
            "portfolio.max_strategy_share",
            self.portfolio.max_strategy_share,
        )?;
        if self.portfolio.max_gross_leverage <= Decimal::ZERO {
            return Err(ConfigValidationError::OutOfRange {
                field: "portfolio.max_gross_leverage".to_string(),
                value: self.portfolio.max_gross_leverage,
                expected: "> 0",
            });
        }

        ensure_fraction("sizing.long_fraction", self.sizing.long_fraction, true)?;
        ensure_fraction("sizing.short_fraction", self.sizing.short_fraction, true)?;
        if self.sizing.long_fraction + self.sizing.short_fraction > Decimal::ONE {
            return Err(ConfigValidationError::OutOfRange {
                field: "sizing.long_fraction + sizing.short_fraction".to_string(),
                value: self.sizing.long_fraction + self.sizing.short_fraction,
                expected: "<= 1",
            });
        }
        if self.sizing.min_data_points < 2 || self.sizing.lookback_days < self.sizing.min_data_points
        {
            return Err(ConfigValidationError::Invalid(format!(
                "sizing.lookback_days ({}) must be >= sizing.min_data_points ({}) >= 2",
                self.sizing.lookback_days, self.sizing.min_data_points
            )));
        }

        ensure_positive_fraction("execution.reprice_step", self.execution.reprice_step)?;
        if self.execution.poll_interval_ms == 0 || self.execution.limit_timeout_ms == 0 {
            return Err(ConfigValidationError::Invalid(
                "execution timeouts must be non-zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigValidationError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.data.warn_after_hours > self.data.halt_after_hours {
            return Err(ConfigValidationError::Invalid(format!(
                "data.warn_after_hours ({}) must not exceed data.halt_after_hours ({})",
                self.data.warn_after_hours, self.data.halt_after_hours
            )));
        }
        if self.persistence.history_capacity == 0 {
            return Err(ConfigValidationError::Invalid(
                "persistence.history_capacity must be at least 1".to_string(),
            ));
        }

        if self.universe.is_empty() {
            return Err(ConfigValidationError::EmptyUniverse);
        }
        if self.strategies.is_empty() {
            return Err(ConfigValidationError::NoStrategies);
        }

        let mut seen = HashSet::new();
        let mut total_weight = Decimal::ZERO;
        for strategy in &self.strategies {
            if !seen.insert(strategy.name.as_str()) {
                return Err(ConfigValidationError::DuplicateStrategy(
                    strategy.name.clone(),
                ));
            }
            ensure_fraction(
                &format!("strategies.{}.weight", strategy.name),
                strategy.weight,
                true,
            )?;
            if strategy.cadence_days == 0 {
                return Err(ConfigValidationError::ZeroCadence(strategy.name.clone()));
            }
            total_weight += strategy.weight;
        }

        if total_weight > Decimal::ONE {
            return Err(ConfigValidationError::WeightSumExceeded { sum: total_weight });
        }

        Ok(())
    }

    /// Check every strategy's adapter against the registered adapter names.
    pub fn validate_adapters(
        &self,
        known: &[&str],
    ) -> std::result::Result<(), ConfigValidationError> {
        for strategy in &self.strategies {
            let adapter = strategy.adapter_name();
            if !known.contains(&adapter) {
                return Err(ConfigValidationError::UnknownAdapter {
                    strategy: strategy.name.clone(),
                    adapter: adapter.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn ensure_fraction(
    field: &str,
    value: Decimal,
    inclusive_upper: bool,
) -> std::result::Result<(), ConfigValidationError> {
    let upper_ok = if inclusive_upper {
        value <= Decimal::ONE
    } else {
        value < Decimal::ONE
    };
    if value < Decimal::ZERO || !upper_ok {
        return Err(ConfigValidationError::OutOfRange {
            field: field.to_string(),
            value,
            expected: if inclusive_upper { "0..=1" } else { "0..1" },
        });
    }
    Ok(())
}

fn ensure_positive_fraction(
    field: &str,
    value: Decimal,
) -> std::result::Result<(), ConfigValidationError> {
    if value <= Decimal::ZERO || value > Decimal::ONE {
        return Err(ConfigValidationError::OutOfRange {
            field: field.to_string(),
            value,
            expected: "(0, 1]",
        });
    }
    Ok(())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            portfolio: PortfolioConfig::default(),
            sizing: SizingConfig::default(),
            execution: ExecutionConfig::default(),
            retry: RetryConfig::default(),
            data: DataConfig::default(),
            persistence: PersistenceConfig::default(),
            paper: PaperConfig::default(),
            universe: Vec::new(),
            strategies: Vec::new(),
        }
    }
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            rebalance_threshold: default_rebalance_threshold(),
            max_strategy_share: default_max_strategy_share(),
            max_gross_leverage: default_max_gross_leverage(),
            quote_asset: default_quote_asset(),
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            lookback_days: default_lookback_days(),
            min_data_points: default_min_data_points(),
            long_fraction: default_side_fraction(),
            short_fraction: default_side_fraction(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: default_execution_mode(),
            dry_run: false,
            limit_timeout_ms: default_limit_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            max_reprices: default_max_reprices(),
            reprice_step: default_reprice_step(),
            default_tick_size: default_tick_size(),
            default_lot_size: default_lot_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            candles_path: default_candles_path(),
            warn_after_hours: default_warn_after_hours(),
            halt_after_hours: default_halt_after_hours(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_capacity: default_history_capacity(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
            spread_bps: default_spread_bps(),
            fee_rate: default_fee_rate(),
            resting_fill_fraction: Decimal::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn strategy(name: &str, weight: Decimal) -> StrategyConfig {
        StrategyConfig {
            name: name.to_string(),
            adapter: None,
            weight,
            flexible: true,
            cadence_days: 7,
            sizing: SizingMode::RiskParity,
            parameters: HashMap::new(),
        }
    }

    fn valid_config() -> Config {
        Config {
            universe: vec![InstrumentConfig {
                instrument: "BTC".to_string(),
                exchange_symbol: None,
                tick_size: None,
                lot_size: None,
            }],
            strategies: vec![strategy("momentum", dec!(0.6)), strategy("carry", dec!(0.4))],
            ..Config::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_default_config_needs_strategies() {
        let config = Config::default();
        assert_eq!(config.validate(), Err(ConfigValidationError::EmptyUniverse));
    }

    #[test]
    fn test_weight_sum_over_one_rejected() {
        let mut config = valid_config();
        config.strategies[1].weight = dec!(0.5);
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::WeightSumExceeded { sum: dec!(1.1) })
        );
    }

    #[test]
    fn test_duplicate_strategy_rejected() {
        let mut config = valid_config();
        config.strategies[1].name = "momentum".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigValidationError::DuplicateStrategy("momentum".to_string()))
        );
    }

    #[test]
    fn test_zero_cadence_rejected() {
        let mut config = valid_config();
        config.strategies[0].cadence_days = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::ZeroCadence(_))
        ));
    }

    #[test]
    fn test_threshold_of_one_rejected() {
        let mut config = valid_config();
        config.portfolio.rebalance_threshold = Decimal::ONE;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_side_fractions_bounded() {
        let mut config = valid_config();
        config.sizing.long_fraction = dec!(0.7);
        config.sizing.short_fraction = dec!(0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_adapter_rejected() {
        let mut config = valid_config();
        assert_eq!(config.validate_adapters(&["momentum", "carry"]), Ok(()));

        config.strategies[1].adapter = Some("mean_reversion".to_string());
        assert_eq!(
            config.validate_adapters(&["momentum", "carry"]),
            Err(ConfigValidationError::UnknownAdapter {
                strategy: "carry".to_string(),
                adapter: "mean_reversion".to_string(),
            })
        );
    }

    #[test]
    fn test_adapter_name_defaults_to_strategy_name() {
        let mut s = strategy("carry", dec!(0.1));
        assert_eq!(s.adapter_name(), "carry");
        s.adapter = Some("static_weights".to_string());
        assert_eq!(s.adapter_name(), "static_weights");
    }
}
