//! # Multi-Strategy Rebalancer
//!
//! Allocates capital across independent trading strategies, turns their
//! selections into risk-weighted targets, diffs those against live positions
//! and executes the difference.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `market`: Candle history, CSV loading and the instrument universe
//! - `strategy`: Adapters, sizing, scheduling, aggregation and trade deltas
//! - `execution`: Order escalation state machine and its async driver
//! - `exchange`: Venue trait, paper venue, dry-run wrapper and retry policy
//! - `risk`: Data freshness checks and operator alerts
//! - `persistence`: SQLite-based schedule, trade log and paper state
//! - `cycle`: One end-to-end rebalance pass
//! - `utils`: Shared decimal helpers

pub mod config;
pub mod cycle;
pub mod exchange;
pub mod execution;
pub mod market;
pub mod persistence;
pub mod risk;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use cycle::{CycleOptions, CycleReport, RebalanceCycle};
