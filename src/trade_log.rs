// =============================================================================
// Trade log — append-only JSON lines, one record per opened position
// =============================================================================

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{AccountMode, Side};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub stop_price: f64,
    pub targets: Vec<f64>,
    pub splits: Vec<f64>,
    pub equity: f64,
    pub account_mode: AccountMode,
    pub entry_order_id: String,
}

pub struct TradeLog {
    path: PathBuf,
    // Serialises appends from concurrent symbol tasks.
    write_lock: Mutex<()>,
}

impl TradeLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn append(&self, record: &TradeRecord) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialise trade record")?;

        let _guard = self.write_lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open trade log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("failed to append to trade log {}", self.path.display()))?;
        Ok(())
    }

    /// Read every record back, skipping lines that do not parse.
    pub fn read_all(&self) -> Result<Vec<TradeRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read trade log {}", self.path.display()))?;
        Ok(content
            .lines()
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(symbol: &str) -> TradeRecord {
        TradeRecord {
            timestamp: Utc::now(),
            symbol: symbol.into(),
            side: Side::Long,
            quantity: 10.0,
            entry_price: 100.0,
            stop_price: 98.0,
            targets: vec![101.0, 102.0, 103.0],
            splits: vec![0.3, 0.3, 0.4],
            equity: 1_000.0,
            account_mode: AccountMode::Demo,
            entry_order_id: "P1".into(),
        }
    }

    #[test]
    fn appends_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path().join("trades.jsonl"));
        log.append(&record("BTCUSDT")).unwrap();
        log.append(&record("ETHUSDT")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("trades.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 2);

        let back = log.read_all().unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[1].symbol, "ETHUSDT");
        assert_eq!(back[0].side, Side::Long);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = TradeLog::new(dir.path().join("none.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
