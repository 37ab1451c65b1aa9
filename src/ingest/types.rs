// src/ingest/types.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A discovered unit of content. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub id: String,          // stable per source, e.g. YouTube video id
    pub title: String,       // normalized
    pub description: String, // normalized, capped
    pub url: String,
    pub source_name: String,
    pub source_category: String, // e.g. "primary" | "secondary"
    pub published_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    /// Entries currently visible in the feed. Ledger/age filtering happens upstream.
    async fn list_new_items(&self) -> Result<Vec<Item>>;
    fn name(&self) -> &str;
}
