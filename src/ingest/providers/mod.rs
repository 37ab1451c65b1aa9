// src/ingest/providers/mod.rs
pub mod feed;

use std::time::Duration;

use crate::config::SourceConfig;
use crate::ingest::types::FeedSource;

/// Build one HTTP provider per configured source. A source that cannot be built
/// is logged and left out; the rest still run.
pub fn build_sources(sources: &[SourceConfig], timeout: Duration) -> Vec<Box<dyn FeedSource>> {
    let mut out: Vec<Box<dyn FeedSource>> = Vec::with_capacity(sources.len());
    for src in sources {
        match feed::FeedProvider::from_source(src, timeout) {
            Ok(p) => out.push(Box::new(p)),
            Err(e) => tracing::warn!(error = ?e, source = %src.name, "skipping source"),
        }
    }
    out
}
