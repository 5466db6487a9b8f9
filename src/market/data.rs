//! Daily candle history consumed by strategy adapters and the sizer.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Data problems that affect a single instrument.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataError {
    #[error("no data for instrument {0}")]
    UnknownInstrument(String),
    #[error("{instrument} has {available} data points, {required} required")]
    InsufficientData {
        instrument: String,
        available: usize,
        required: usize,
    },
    #[error("{instrument} data is {age_hours}h old")]
    Stale { instrument: String, age_hours: i64 },
}

/// Candle series per instrument, oldest first.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    series: HashMap<String, Vec<Candle>>,
}

impl MarketData {
    /// Build from unordered `(instrument, candle)` pairs.
    ///
    /// Series are sorted by timestamp; a later duplicate timestamp replaces an
    /// earlier one.
    pub fn from_candles<I>(candles: I) -> Self
    where
        I: IntoIterator<Item = (String, Candle)>,
    {
        let mut series: HashMap<String, Vec<Candle>> = HashMap::new();
        for (instrument, candle) in candles {
            series.entry(instrument).or_default().push(candle);
        }
        for candles in series.values_mut() {
            candles.sort_by_key(|c| c.timestamp);
            candles.dedup_by(|later, earlier| {
                if later.timestamp == earlier.timestamp {
                    std::mem::swap(later, earlier);
                    true
                } else {
                    false
                }
            });
        }
        Self { series }
    }

    /// Instruments with at least one candle, sorted.
    pub fn instruments(&self) -> Vec<String> {
        let mut instruments: Vec<String> = self
            .series
            .iter()
            .filter(|(_, candles)| !candles.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        instruments.sort();
        instruments
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.series.get(instrument).is_some_and(|c| !c.is_empty())
    }

    pub fn candles(&self, instrument: &str) -> Option<&[Candle]> {
        self.series.get(instrument).map(|c| c.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(|c| c.is_empty())
    }

    /// Closing prices, oldest first.
    pub fn closes(&self, instrument: &str) -> Vec<Decimal> {
        self.candles(instrument)
            .map(|candles| candles.iter().map(|c| c.close).collect())
            .unwrap_or_default()
    }

    /// Most recent close.
    pub fn last_close(&self, instrument: &str) -> Option<Decimal> {
        self.candles(instrument)
            .and_then(|c| c.last())
            .map(|c| c.close)
    }

    /// Most recent candle timestamp.
    pub fn last_timestamp(&self, instrument: &str) -> Option<DateTime<Utc>> {
        self.candles(instrument)
            .and_then(|c| c.last())
            .map(|c| c.timestamp)
    }

    /// Latest close per instrument.
    pub fn latest_closes(&self) -> HashMap<String, Decimal> {
        self.series
            .keys()
            .filter_map(|name| self.last_close(name).map(|close| (name.clone(), close)))
            .collect()
    }

    /// Simple close-to-close returns over at most the last `lookback` periods.
    ///
    /// Pairs with a non-positive previous close are skipped.
    pub fn returns(&self, instrument: &str, lookback: usize) -> Result<Vec<Decimal>, DataError> {
        let closes = self.closes(instrument);
        if closes.is_empty() {
            return Err(DataError::UnknownInstrument(instrument.to_string()));
        }
        let returns: Vec<Decimal> = closes
            .windows(2)
            .filter(|w| w[0] > Decimal::ZERO)
            .map(|w| (w[1] - w[0]) / w[0])
            .collect();
        let start = returns.len().saturating_sub(lookback);
        Ok(returns[start..].to_vec())
    }

    /// Candles strictly before the day after `date`.
    ///
    /// Used to evaluate a cycle as of a given date.
    pub fn as_of(&self, date: NaiveDate) -> Self {
        let Some(cutoff) = date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|dt| dt.and_utc())
        else {
            return self.clone();
        };
        let series = self
            .series
            .iter()
            .map(|(name, candles)| {
                let kept: Vec<Candle> = candles
                    .iter()
                    .filter(|c| c.timestamp < cutoff)
                    .cloned()
                    .collect();
                (name.clone(), kept)
            })
            .filter(|(_, candles)| !candles.is_empty())
            .collect();
        Self { series }
    }

    /// A copy without the given instruments.
    pub fn without(&self, excluded: &[String]) -> Self {
        Self {
            series: self
                .series
                .iter()
                .filter(|(name, _)| !excluded.contains(name))
                .map(|(name, candles)| (name.clone(), candles.clone()))
                .collect(),
        }
    }
}

/// Source of candle history.
pub trait MarketDataSource: Send + Sync {
    fn load(&self) -> Result<MarketData>;
}

/// CSV candle loader.
///
/// Expected CSV format:
/// ```csv
/// timestamp,instrument,open,high,low,close,volume
/// 2024-01-01T00:00:00Z,BTC,42000,42500,41800,42300.5,1523.4
/// ```
/// A bare `YYYY-MM-DD` timestamp is read as midnight UTC.
#[derive(Debug, Clone)]
pub struct CsvCandleLoader {
    path: std::path::PathBuf,
}

impl CsvCandleLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Parse CSV content into market data.
    pub fn from_csv_content(content: &str) -> Result<MarketData> {
        let mut rows: Vec<(String, Candle)> = Vec::new();

        for (line_num, line) in content.lines().enumerate() {
            // Skip header
            if line_num == 0 && line.starts_with("timestamp") {
                continue;
            }

            if line.trim().is_empty() {
                continue;
            }

            let row = CsvRow::parse(line)
                .with_context(|| format!("Failed to parse line {}: {}", line_num + 1, line))?;
            rows.push((row.instrument, row.candle));
        }

        if rows.is_empty() {
            anyhow::bail!("CSV file contains no data rows");
        }

        Ok(MarketData::from_candles(rows))
    }
}

impl MarketDataSource for CsvCandleLoader {
    fn load(&self) -> Result<MarketData> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read CSV file: {}", self.path.display()))?;
        Self::from_csv_content(&content)
    }
}

struct CsvRow {
    instrument: String,
    candle: Candle,
}

impl CsvRow {
    fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.split(',').map(str::trim).collect();
        if parts.len() < 7 {
            anyhow::bail!(
                "Expected 7 columns (timestamp,instrument,open,high,low,close,volume), got {}",
                parts.len()
            );
        }

        let decimal = |idx: usize, field: &str| -> Result<Decimal> {
            parts[idx]
                .parse()
                .with_context(|| format!("Invalid {}: {}", field, parts[idx]))
        };

        Ok(Self {
            instrument: parts[1].to_string(),
            candle: Candle {
                timestamp: parse_timestamp(parts[0])?,
                open: decimal(2, "open")?,
                high: decimal(3, "high")?,
                low: decimal(4, "low")?,
                close: decimal(5, "close")?,
                volume: decimal(6, "volume")?,
            },
        })
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = raw.parse::<DateTime<Utc>>() {
        return Ok(ts);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("Invalid timestamp: {}", raw))?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .with_context(|| format!("Invalid timestamp: {}", raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    const CSV: &str = r#"timestamp,instrument,open,high,low,close,volume
2024-01-02,BTC,100,112,99,110,10
2024-01-01T00:00:00Z,BTC,95,101,94,100,12
2024-01-03,BTC,110,111,98,99,9
2024-01-01,ETH,10,10,10,10,1
2024-01-02,ETH,10,11,10,11,1
"#;

    #[test]
    fn test_csv_parsing_sorts_series() {
        let data = CsvCandleLoader::from_csv_content(CSV).unwrap();

        assert_eq!(data.instruments(), vec!["BTC", "ETH"]);
        assert_eq!(data.closes("BTC"), vec![dec!(100), dec!(110), dec!(99)]);
        assert_eq!(data.last_close("ETH"), Some(dec!(11)));
        assert_eq!(
            data.last_timestamp("BTC"),
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_returns_are_close_to_close() {
        let data = CsvCandleLoader::from_csv_content(CSV).unwrap();

        let returns = data.returns("BTC", 30).unwrap();
        assert_eq!(returns, vec![dec!(0.1), dec!(-0.1)]);

        // Lookback keeps only the most recent returns
        assert_eq!(data.returns("BTC", 1).unwrap(), vec![dec!(-0.1)]);

        assert_eq!(
            data.returns("SOL", 30),
            Err(DataError::UnknownInstrument("SOL".to_string()))
        );
    }

    #[test]
    fn test_as_of_drops_future_candles() {
        let data = CsvCandleLoader::from_csv_content(CSV).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let trimmed = data.as_of(day2);
        assert_eq!(trimmed.closes("BTC"), vec![dec!(100), dec!(110)]);
        assert_eq!(trimmed.closes("ETH"), vec![dec!(10), dec!(11)]);
    }

    #[test]
    fn test_without_removes_instruments() {
        let data = CsvCandleLoader::from_csv_content(CSV).unwrap();
        let filtered = data.without(&["BTC".to_string()]);
        assert_eq!(filtered.instruments(), vec!["ETH"]);
    }

    #[test]
    fn test_bad_row_reports_line() {
        let err = CsvCandleLoader::from_csv_content("timestamp,instrument\n2024-01-01,BTC,1,2\n")
            .unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, CSV.as_bytes()).unwrap();

        let data = CsvCandleLoader::new(file.path()).load().unwrap();
        assert_eq!(data.instruments().len(), 2);
    }
}
