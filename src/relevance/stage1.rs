// src/relevance/stage1.rs
//! Stage 1: cheap, recall-oriented keyword filter over title + description.
//!
//! Each keyword group contributes its weight once (first matching keyword wins);
//! negative groups subtract. An item passes when the sum reaches the configured
//! minimum, or when any single matched group is a high-weight group.

use crate::config::KeywordConfig;
use crate::ingest::types::Item;

#[derive(Debug, Clone, Copy)]
pub struct Stage1Policy {
    pub min_score: i32,
    pub high_weight: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage1Result {
    pub item: Item,
    pub passed: bool,
    pub score: i32,
    /// `group(keyword)` for every matched group, in group-name order.
    pub matches: Vec<String>,
}

/// Weighted keyword score over `text` (matched case-insensitively).
pub fn keyword_score(text: &str, keywords: &KeywordConfig) -> (i32, Vec<String>, i32) {
    let text = text.to_lowercase();
    let mut score = 0i32;
    let mut matches = Vec::new();
    let mut best_positive = 0i32;

    for (group_name, group) in &keywords.keyword_groups {
        if let Some(kw) = group.keywords.iter().find(|k| text.contains(k.as_str())) {
            score += group.weight;
            best_positive = best_positive.max(group.weight);
            matches.push(format!("{group_name}({kw})"));
        }
    }
    (score, matches, best_positive)
}

/// Pure function of (item, keywords, policy).
pub fn evaluate(item: Item, keywords: &KeywordConfig, policy: Stage1Policy) -> Stage1Result {
    let text = format!("{} {}", item.title, item.description);
    let (score, matches, best_positive) = keyword_score(&text, keywords);

    let high_hit = policy
        .high_weight
        .is_some_and(|hw| best_positive > 0 && best_positive >= hw);
    let passed = score >= policy.min_score || high_hit;

    Stage1Result {
        item,
        passed,
        score,
        matches,
    }
}

/// Keep at most `max` survivors, choosing the highest Stage 1 scores but
/// returning them in discovery order.
pub fn cap_survivors(mut survivors: Vec<Stage1Result>, max: usize) -> (Vec<Stage1Result>, usize) {
    if survivors.len() <= max {
        return (survivors, 0);
    }
    let mut order: Vec<usize> = (0..survivors.len()).collect();
    // stable: ties keep discovery order
    order.sort_by(|&a, &b| survivors[b].score.cmp(&survivors[a].score));
    let mut keep: Vec<usize> = order.into_iter().take(max).collect();
    keep.sort_unstable();

    let dropped = survivors.len() - keep.len();
    let mut idx = 0usize;
    survivors.retain(|_| {
        let k = keep.binary_search(&idx).is_ok();
        idx += 1;
        k
    });
    (survivors, dropped)
}
