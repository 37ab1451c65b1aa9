// src/ledger.rs
//! Processed-item ledger: item id → dispatch record, written once per id.
//!
//! A record is created only after a real dispatch attempt resolves, whatever the
//! outcome. Because records are never overwritten, an item that was dispatched
//! (or failed) is never dispatched again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::store::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Completed,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchStatus::Completed => "completed",
            DispatchStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub item_id: String,
    pub title: String,
    pub url: String,
    pub source_name: String,
    pub score: f32,
    pub status: DispatchStatus,
    pub dispatched_at: DateTime<Utc>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    /// Amount reserved for this dispatch.
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("item `{0}` already has a ledger record")]
    Duplicate(String),
    #[error("ledger I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("ledger lock poisoned")]
    Poisoned,
}

/// Durable when opened from a path, memory-only otherwise. Same interface either way.
#[derive(Debug)]
pub struct Ledger {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, ProcessedRecord>>,
}

impl Ledger {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load the ledger file (missing file = empty ledger).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        let records = read_json(&path)
            .map_err(|source| LedgerError::Io {
                path: path.clone(),
                source,
            })?
            .unwrap_or_default();
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    pub fn is_processed(&self, item_id: &str) -> Result<bool, LedgerError> {
        let g = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(g.contains_key(item_id))
    }

    pub fn get(&self, item_id: &str) -> Result<Option<ProcessedRecord>, LedgerError> {
        let g = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(g.get(item_id).cloned())
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        let g = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(g.len())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }

    /// Insert a record keyed by `record.item_id`. Fails with `Duplicate` if one
    /// exists. The file is rewritten before returning.
    ///
    /// A write failure is returned as `Io`, but the record stays in memory: the
    /// dispatch it describes already happened, so this ledger must keep refusing
    /// the item. The next successful write persists it along with the rest.
    pub fn mark_processed(&self, record: ProcessedRecord) -> Result<(), LedgerError> {
        let mut g = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        if g.contains_key(&record.item_id) {
            return Err(LedgerError::Duplicate(record.item_id));
        }
        g.insert(record.item_id.clone(), record);

        if let Some(path) = &self.path {
            if let Err(source) = write_json_atomic(path, &*g) {
                return Err(LedgerError::Io {
                    path: path.clone(),
                    source,
                });
            }
        }
        Ok(())
    }

    /// Snapshot of all records, ordered by item id.
    pub fn records(&self) -> Result<Vec<ProcessedRecord>, LedgerError> {
        let g = self.records.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(g.values().cloned().collect())
    }
}
