// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod budget;
pub mod config;
pub mod dispatch;
pub mod ingest;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod relevance;
pub mod scheduler;
pub mod store;
