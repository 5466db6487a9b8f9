//! SQLite persistence.
//!
//! Survives restarts:
//! - Per-strategy rebalance schedule state (one JSON record per strategy)
//! - Append-only trade log
//! - Paper venue account and positions

mod lock;

pub use lock::RunLock;

use crate::exchange::{OrderSide, OrderType, PaperPosition, PaperSnapshot};
use crate::execution::TradeRecord;
use crate::strategy::{RebalanceState, ScheduleStore};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// SQLite-based persistence manager.
pub struct PersistenceManager {
    conn: Connection,
}

impl PersistenceManager {
    /// Open (or create) the database and initialise the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let manager = Self { conn };
        manager.init_schema()?;

        info!("Persistence manager initialized at {:?}", db_path.as_ref());
        Ok(manager)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Schedule state, one row per strategy
            CREATE TABLE IF NOT EXISTS rebalance_state (
                strategy TEXT PRIMARY KEY,
                state_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Fills, append-only
            CREATE TABLE IF NOT EXISTS trade_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                cycle_date TEXT NOT NULL,
                venue TEXT NOT NULL,
                instrument TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                order_id INTEGER NOT NULL,
                quantity TEXT NOT NULL,
                price TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trade_log_cycle ON trade_log(cycle_date);

            -- Paper account (singleton row)
            CREATE TABLE IF NOT EXISTS paper_account (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                balance TEXT NOT NULL,
                total_fees TEXT NOT NULL,
                order_count INTEGER NOT NULL,
                last_saved TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS paper_positions (
                symbol TEXT PRIMARY KEY,
                quantity TEXT NOT NULL,
                avg_entry_price TEXT NOT NULL
            );
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Append fills from one cycle.
    pub fn record_trades(&self, cycle_date: NaiveDate, trades: &[TradeRecord]) -> Result<()> {
        if trades.is_empty() {
            return Ok(());
        }
        let tx = self.conn.unchecked_transaction()?;
        for trade in trades {
            tx.execute(
                r#"
                INSERT INTO trade_log (timestamp, cycle_date, venue, instrument, symbol, side,
                                       order_type, order_id, quantity, price)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    trade.timestamp.to_rfc3339(),
                    cycle_date.to_string(),
                    trade.venue,
                    trade.instrument,
                    trade.exchange_symbol,
                    trade.side.to_string(),
                    trade.order_type.to_string(),
                    trade.order_id,
                    trade.quantity.to_string(),
                    trade.price.to_string(),
                ],
            )?;
        }
        tx.commit()?;

        debug!(count = trades.len(), %cycle_date, "Trades recorded");
        Ok(())
    }

    /// Most recent fills, newest first.
    pub fn recent_trades(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT timestamp, venue, instrument, symbol, side, order_type, order_id, quantity, price
            FROM trade_log
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut trades = Vec::new();
        for row in rows {
            let (timestamp, venue, instrument, symbol, side, order_type, order_id, quantity, price) = row?;
            trades.push(TradeRecord {
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|dt| dt.with_timezone(&Utc))
                    .with_context(|| format!("Invalid trade timestamp: {}", timestamp))?,
                venue,
                instrument,
                exchange_symbol: symbol,
                side: parse_side(&side)?,
                order_type: parse_order_type(&order_type)?,
                order_id,
                quantity: Decimal::from_str(&quantity).unwrap_or_default(),
                price: Decimal::from_str(&price).unwrap_or_default(),
            });
        }
        Ok(trades)
    }

    /// Save the paper account, replacing the previous snapshot.
    pub fn save_paper_state(&self, snapshot: &PaperSnapshot) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;

        tx.execute(
            r#"
            INSERT INTO paper_account (id, balance, total_fees, order_count, last_saved)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                balance = ?1,
                total_fees = ?2,
                order_count = ?3,
                last_saved = ?4
            "#,
            params![
                snapshot.balance.to_string(),
                snapshot.total_fees.to_string(),
                snapshot.order_count as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;

        // Clear and reinsert positions
        tx.execute("DELETE FROM paper_positions", [])?;
        for pos in &snapshot.positions {
            tx.execute(
                "INSERT INTO paper_positions (symbol, quantity, avg_entry_price) VALUES (?1, ?2, ?3)",
                params![pos.symbol, pos.quantity.to_string(), pos.avg_entry_price.to_string()],
            )?;
        }

        tx.commit()?;

        debug!(
            balance = %snapshot.balance,
            positions = snapshot.positions.len(),
            "Paper state saved to database"
        );
        Ok(())
    }

    /// Load the paper account, if one was ever saved.
    pub fn load_paper_state(&self) -> Result<Option<PaperSnapshot>> {
        let account: Option<(String, String, i64)> = self
            .conn
            .query_row(
                "SELECT balance, total_fees, order_count FROM paper_account WHERE id = 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((balance, total_fees, order_count)) = account else {
            return Ok(None);
        };

        let mut stmt = self
            .conn
            .prepare("SELECT symbol, quantity, avg_entry_price FROM paper_positions ORDER BY symbol")?;
        let positions: Vec<PaperPosition> = stmt
            .query_map([], |row| {
                Ok(PaperPosition {
                    symbol: row.get(0)?,
                    quantity: Decimal::from_str(&row.get::<_, String>(1)?).unwrap_or_default(),
                    avg_entry_price: Decimal::from_str(&row.get::<_, String>(2)?).unwrap_or_default(),
                })
            })?
            .filter_map(|r| r.ok())
            .collect();

        let snapshot = PaperSnapshot {
            balance: Decimal::from_str(&balance).context("Invalid paper balance")?,
            positions,
            total_fees: Decimal::from_str(&total_fees).unwrap_or_default(),
            order_count: order_count as u64,
        };

        info!(
            balance = %snapshot.balance,
            positions = snapshot.positions.len(),
            "Loaded paper state from database"
        );
        Ok(Some(snapshot))
    }
}

impl ScheduleStore for PersistenceManager {
    fn load_state(&self, strategy: &str) -> Result<Option<RebalanceState>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT state_json FROM rebalance_state WHERE strategy = ?1",
                [strategy],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|json| {
            serde_json::from_str(&json)
                .with_context(|| format!("Corrupt rebalance state for {}", strategy))
        })
        .transpose()
    }

    fn save_state(&self, state: &RebalanceState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.conn.execute(
            r#"
            INSERT INTO rebalance_state (strategy, state_json, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(strategy) DO UPDATE SET
                state_json = ?2,
                updated_at = ?3
            "#,
            params![state.strategy_name, json, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn load_all_states(&self) -> Result<Vec<RebalanceState>> {
        let mut stmt = self
            .conn
            .prepare("SELECT strategy, state_json FROM rebalance_state ORDER BY strategy")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;

        let mut states = Vec::new();
        for row in rows {
            let (strategy, json) = row?;
            match serde_json::from_str(&json) {
                Ok(state) => states.push(state),
                Err(e) => warn!(%strategy, error = %e, "Skipping corrupt rebalance state"),
            }
        }
        Ok(states)
    }
}

fn parse_side(raw: &str) -> Result<OrderSide> {
    match raw {
        "BUY" => Ok(OrderSide::Buy),
        "SELL" => Ok(OrderSide::Sell),
        other => bail!("Invalid order side: {}", other),
    }
}

fn parse_order_type(raw: &str) -> Result<OrderType> {
    match raw {
        "LIMIT" => Ok(OrderType::Limit),
        "MARKET" => Ok(OrderType::Market),
        other => bail!("Invalid order type: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{RebalanceHistoryEntry, Weights};
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    fn state(name: &str) -> RebalanceState {
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let weights = Weights::from([("BTC".to_string(), dec!(0.25)), ("ETH".to_string(), dec!(-0.25))]);
        RebalanceState {
            strategy_name: name.to_string(),
            cadence_days: 7,
            last_rebalance_date: Some(date),
            next_rebalance_date: NaiveDate::from_ymd_opt(2024, 6, 8).unwrap(),
            current_weights: weights.clone(),
            history: VecDeque::from([RebalanceHistoryEntry {
                date,
                weights,
                instruments: 2,
            }]),
        }
    }

    #[test]
    fn test_rebalance_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        {
            let manager = PersistenceManager::new(&path).unwrap();
            manager.save_state(&state("momentum")).unwrap();
        }

        let manager = PersistenceManager::new(&path).unwrap();
        assert_eq!(manager.load_state("momentum").unwrap(), Some(state("momentum")));
        assert_eq!(manager.load_state("carry").unwrap(), None);
    }

    #[test]
    fn test_save_state_overwrites() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.save_state(&state("momentum")).unwrap();

        let mut updated = state("momentum");
        updated.cadence_days = 14;
        manager.save_state(&updated).unwrap();

        let all = manager.load_all_states().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].cadence_days, 14);
    }

    #[test]
    fn test_corrupt_state_is_an_error_and_skipped_in_listing() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.save_state(&state("good")).unwrap();
        manager
            .conn
            .execute(
                "INSERT INTO rebalance_state (strategy, state_json, updated_at) VALUES ('bad', '{not json', '')",
                [],
            )
            .unwrap();

        assert!(manager.load_state("bad").is_err());
        let all = manager.load_all_states().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].strategy_name, "good");
    }

    #[test]
    fn test_scheduler_lists_persisted_states() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        manager.save_state(&state("momentum")).unwrap();
        manager.save_state(&state("core")).unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 6, 3).unwrap();
        let scheduler = crate::strategy::RebalanceScheduler::new(&manager, today, 10);
        let names: Vec<String> = scheduler.states().unwrap().into_iter().map(|s| s.strategy_name).collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"momentum".to_string()));
        assert!(names.contains(&"core".to_string()));
    }

    #[test]
    fn test_trade_log_round_trip() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
        let trade = |id: i64, qty: Decimal| TradeRecord {
            timestamp: Utc::now(),
            venue: "paper".to_string(),
            instrument: "BTC".to_string(),
            exchange_symbol: "BTCUSDT".to_string(),
            side: OrderSide::Sell,
            order_type: OrderType::Limit,
            order_id: id,
            quantity: qty,
            price: dec!(50010.5),
        };

        manager
            .record_trades(date, &[trade(1, dec!(0.1)), trade(2, dec!(0.05))])
            .unwrap();

        let recent = manager.recent_trades(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].order_id, 2);
        assert_eq!(recent[0].side, OrderSide::Sell);
        assert_eq!(recent[1].quantity, dec!(0.1));
        assert_eq!(recent[1].price, dec!(50010.5));
    }

    #[test]
    fn test_paper_state_round_trip() {
        let manager = PersistenceManager::new(":memory:").unwrap();
        assert!(manager.load_paper_state().unwrap().is_none());

        let snapshot = PaperSnapshot {
            balance: dec!(9500.25),
            positions: vec![PaperPosition {
                symbol: "ETHUSDT".to_string(),
                quantity: dec!(-0.2),
                avg_entry_price: dec!(2500),
            }],
            total_fees: dec!(0.4),
            order_count: 3,
        };
        manager.save_paper_state(&snapshot).unwrap();
        assert_eq!(manager.load_paper_state().unwrap(), Some(snapshot));
    }
}
