// src/ingest/mod.rs
pub mod providers;
pub mod types;

use crate::ingest::types::{FeedSource, Item};
use crate::ledger::Ledger;
use anyhow::Result;
use chrono::{DateTime, Utc};
use metrics::counter;
use std::collections::HashSet;

pub const MAX_TITLE_CHARS: usize = 300;
pub const MAX_DESCRIPTION_CHARS: usize = 500;

/// Normalize text: decode entities, strip tags, collapse whitespace, cap length.
pub fn normalize_text(s: &str, max_chars: usize) -> String {
    // 1) HTML entity decode
    let mut out = html_escape::decode_html_entities(s).to_string();

    // 2) Strip HTML tags
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[^>]+>").unwrap());
    out = re_tags.replace_all(&out, "").to_string();

    // 3) Normalize “ ” ‘ ’ « » to ASCII quotes
    out = out
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 4) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    out = re_ws.replace_all(&out, " ").trim().to_string();

    // 5) Length cap
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars).collect();
    }

    out
}

/// Counters for one discovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub sources_ok: usize,
    pub sources_failed: usize,
    pub fetched: usize,
    pub already_processed: usize,
    pub too_old: usize,
    pub duplicates: usize,
}

/// Drop entries that are stale, repeated within this pass, or already in the ledger.
/// Age is counted in whole elapsed days, so an entry 7.9 days old still passes a
/// 7-day window. Entries without a publish date count as stale.
pub fn filter_candidates(
    now: DateTime<Utc>,
    raw: Vec<Item>,
    ledger: &Ledger,
    max_age_days: i64,
    stats: &mut DiscoveryStats,
) -> Result<Vec<Item>> {
    let max_age_days = max_age_days.max(0);
    let mut seen: HashSet<String> = HashSet::new();
    let mut keep = Vec::with_capacity(raw.len());

    for item in raw {
        if !seen.insert(item.id.clone()) {
            stats.duplicates += 1;
            continue;
        }
        // ledger first: known items never re-enter the gate, not even Stage 1
        if ledger.is_processed(&item.id)? {
            stats.already_processed += 1;
            continue;
        }
        match item.published_at {
            Some(ts) if (now - ts).num_days() <= max_age_days => keep.push(item),
            _ => stats.too_old += 1,
        }
    }
    Ok(keep)
}

/// Fetch every source, tolerating per-source failures, and return new candidates
/// in discovery order.
///
/// Errors only when every configured source failed (or the ledger is unreadable).
pub async fn collect_candidates(
    sources: &[Box<dyn FeedSource>],
    ledger: &Ledger,
    now: DateTime<Utc>,
    max_age_days: i64,
) -> Result<(Vec<Item>, DiscoveryStats)> {
    let mut stats = DiscoveryStats::default();
    let mut raw = Vec::new();

    for src in sources {
        match src.list_new_items().await {
            Ok(mut items) => {
                tracing::debug!(
                    target: "cycle",
                    source = src.name(),
                    entries = items.len(),
                    "feed fetched"
                );
                stats.sources_ok += 1;
                raw.append(&mut items);
            }
            Err(e) => {
                tracing::warn!(
                    target: "cycle",
                    error = ?e,
                    source = src.name(),
                    "feed fetch failed"
                );
                counter!("feed_errors_total").increment(1);
                stats.sources_failed += 1;
            }
        }
    }

    if !sources.is_empty() && stats.sources_ok == 0 {
        anyhow::bail!("all {} feed sources failed", sources.len());
    }

    stats.fetched = raw.len();
    let kept = filter_candidates(now, raw, ledger, max_age_days, &mut stats)?;
    Ok((kept, stats))
}
