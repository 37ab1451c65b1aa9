// src/budget.rs
//! Daily spend guard with a hard ceiling.
//!
//! `try_reserve` is the only mutation: it checks `spent + amount <= cap` for the
//! current UTC day and records the reservation before returning `true`.
//! Reservations are never refunded. A new UTC day starts from zero; earlier days
//! stay in the record.

use chrono::{NaiveDate, Utc};
use metrics::gauge;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::store::{read_json, write_json_atomic};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DayTotal {
    pub spent_usd: f64,
    pub invocations: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BudgetRecord {
    #[serde(default)]
    days: BTreeMap<NaiveDate, DayTotal>,
}

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error("budget I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid reservation amount {0}")]
    InvalidAmount(f64),
    #[error("budget lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetSummary {
    pub day: NaiveDate,
    pub daily_cap_usd: f64,
    pub spent_usd: f64,
    pub remaining_usd: f64,
    pub invocations: u32,
}

impl std::fmt::Display for BudgetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Date: {}, Spent: ${:.2} of ${:.2}, Remaining: ${:.2}, Invocations: {}",
            self.day, self.spent_usd, self.daily_cap_usd, self.remaining_usd, self.invocations
        )
    }
}

// Compare in integer micro-dollars so 0.1 + 0.2 style drift can't let a
// reservation slip past the cap.
fn to_micros(usd: f64) -> i64 {
    (usd * 1_000_000.0).round() as i64
}

fn from_micros(m: i64) -> f64 {
    m as f64 / 1_000_000.0
}

pub fn today_utc() -> NaiveDate {
    Utc::now().date_naive()
}

#[derive(Debug)]
pub struct BudgetGuard {
    path: Option<PathBuf>,
    daily_cap_usd: f64,
    state: Mutex<BudgetRecord>,
}

impl BudgetGuard {
    pub fn in_memory(daily_cap_usd: f64) -> Self {
        Self {
            path: None,
            daily_cap_usd,
            state: Mutex::new(BudgetRecord::default()),
        }
    }

    pub fn open(path: impl AsRef<Path>, daily_cap_usd: f64) -> Result<Self, BudgetError> {
        let path = path.as_ref().to_path_buf();
        let state = read_json(&path)
            .map_err(|source| BudgetError::Io {
                path: path.clone(),
                source,
            })?
            .unwrap_or_default();
        Ok(Self {
            path: Some(path),
            daily_cap_usd,
            state: Mutex::new(state),
        })
    }

    pub fn current_spend(&self, day: NaiveDate) -> Result<f64, BudgetError> {
        Ok(self.day_total(day)?.spent_usd)
    }

    pub fn remaining_budget(&self, day: NaiveDate) -> Result<f64, BudgetError> {
        let spent = to_micros(self.current_spend(day)?);
        Ok(from_micros((to_micros(self.daily_cap_usd) - spent).max(0)))
    }

    pub fn day_total(&self, day: NaiveDate) -> Result<DayTotal, BudgetError> {
        let g = self.state.lock().map_err(|_| BudgetError::Poisoned)?;
        Ok(g.days.get(&day).copied().unwrap_or_default())
    }

    pub fn summary(&self, day: NaiveDate) -> Result<BudgetSummary, BudgetError> {
        let total = self.day_total(day)?;
        Ok(BudgetSummary {
            day,
            daily_cap_usd: self.daily_cap_usd,
            spent_usd: total.spent_usd,
            remaining_usd: self.remaining_budget(day)?,
            invocations: total.invocations,
        })
    }

    /// Reserve `amount` against today's (UTC) cap.
    pub fn try_reserve(&self, amount: f64) -> Result<bool, BudgetError> {
        self.try_reserve_on(today_utc(), amount)
    }

    /// Reserve `amount` against `day`'s cap. Returns `Ok(false)` without touching
    /// state when the reservation would exceed the cap.
    pub fn try_reserve_on(&self, day: NaiveDate, amount: f64) -> Result<bool, BudgetError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(BudgetError::InvalidAmount(amount));
        }
        let mut g = self.state.lock().map_err(|_| BudgetError::Poisoned)?;
        let prev = g.days.get(&day).copied().unwrap_or_default();
        let next_micros = to_micros(prev.spent_usd) + to_micros(amount);
        if next_micros > to_micros(self.daily_cap_usd) {
            return Ok(false);
        }

        g.days.insert(
            day,
            DayTotal {
                spent_usd: from_micros(next_micros),
                invocations: prev.invocations.saturating_add(1),
            },
        );
        if let Some(path) = &self.path {
            if let Err(source) = write_json_atomic(path, &*g) {
                // not persisted → not reserved
                g.days.insert(day, prev);
                return Err(BudgetError::Io {
                    path: path.clone(),
                    source,
                });
            }
        }
        gauge!("budget_spent_usd").set(from_micros(next_micros));
        Ok(true)
    }
}
