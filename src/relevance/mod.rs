// src/relevance/mod.rs
//! Two-stage relevance gate.
//!
//! Stage 1 is free (keywords over title + description) and runs on every new
//! candidate. Stage 2 pays for one metadata lookup per Stage 1 survivor.
//! Anything discarded by either stage is never re-evaluated in the same cycle.

pub mod metadata;
pub mod stage1;
pub mod stage2;

use metrics::counter;

use crate::config::app::ScoringConfig;
use crate::config::KeywordConfig;
use crate::ingest::types::Item;
use metadata::MetadataLookup;
use stage1::{Stage1Policy, Stage1Result};
use stage2::Stage2Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateStats {
    pub evaluated: usize,
    pub stage1_passed: usize,
    /// Stage 1 survivors deferred by the per-poll cap.
    pub deferred: usize,
    pub metadata_errors: usize,
    pub stage2_passed: usize,
}

/// Stage 1 over all candidates, then the per-poll cap. Survivors keep discovery order.
pub fn run_stage1(
    items: Vec<Item>,
    keywords: &KeywordConfig,
    policy: Stage1Policy,
    max_per_poll: usize,
    stats: &mut GateStats,
) -> Vec<Stage1Result> {
    stats.evaluated += items.len();
    let mut survivors = Vec::new();
    for item in items {
        let r = stage1::evaluate(item, keywords, policy);
        if r.passed {
            tracing::info!(
                target: "cycle",
                id = %r.item.id,
                score = r.score,
                matches = %r.matches.join(", "),
                "stage1 pass"
            );
            survivors.push(r);
        } else {
            tracing::debug!(target: "cycle", id = %r.item.id, score = r.score, "stage1 drop");
        }
    }
    stats.stage1_passed += survivors.len();
    counter!("stage1_pass_total").increment(survivors.len() as u64);

    let (kept, deferred) = stage1::cap_survivors(survivors, max_per_poll);
    if deferred > 0 {
        tracing::info!(
            target: "cycle",
            deferred,
            max_per_poll,
            "per-poll cap reached; extra items deferred"
        );
    }
    stats.deferred += deferred;
    kept
}

/// Stage 2 over Stage 1 survivors. Returns qualifying items in discovery order.
///
/// A failed metadata lookup discards that item only; the rest are still scored.
pub async fn run_stage2(
    survivors: Vec<Stage1Result>,
    lookup: &dyn MetadataLookup,
    keywords: &KeywordConfig,
    scoring: &ScoringConfig,
    threshold: f32,
    stats: &mut GateStats,
) -> Vec<Stage2Result> {
    let mut qualifying = Vec::new();
    for s1 in survivors {
        let meta = match lookup.fetch_metadata(&s1.item).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    target: "cycle",
                    id = %s1.item.id,
                    error = ?e,
                    "metadata lookup failed; item skipped"
                );
                counter!("metadata_errors_total").increment(1);
                stats.metadata_errors += 1;
                continue;
            }
        };

        let r = stage2::score(&s1.item, &meta, keywords, scoring);
        if r.qualifies(threshold) {
            tracing::info!(
                target: "cycle",
                id = %r.item.id,
                score = r.score,
                threshold,
                reasons = %r.reasons.join(", "),
                "stage2 pass"
            );
            qualifying.push(r);
        } else {
            tracing::info!(
                target: "cycle",
                id = %r.item.id,
                score = r.score,
                threshold,
                "stage2 drop"
            );
        }
    }
    stats.stage2_passed += qualifying.len();
    counter!("stage2_pass_total").increment(qualifying.len() as u64);
    qualifying
}
