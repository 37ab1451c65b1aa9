// src/relevance/stage2.rs
//! Stage 2: deterministic metadata scoring.
//!
//! Composite = tag + duration + density + category + social + chapters, each
//! capped on its own. Short items are then capped, negative groups subtract a fixed penalty,
//! and the result is clamped to `0..=MAX_SCORE` and rounded to one decimal.

use crate::config::app::{ScoringConfig, MAX_SCORE};
use crate::config::KeywordConfig;
use crate::ingest::types::Item;
use crate::relevance::metadata::Metadata;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreBreakdown {
    pub tag: f32,
    pub duration: f32,
    pub density: f32,
    pub category: f32,
    pub social: f32,
    pub chapters: f32,
    pub short_cap: Option<f32>,
    pub negative_penalty: f32,
    pub total: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage2Result {
    pub item: Item,
    pub score: f32,
    pub breakdown: ScoreBreakdown,
    pub reasons: Vec<String>,
}

impl Stage2Result {
    pub fn qualifies(&self, threshold: f32) -> bool {
        self.score >= threshold
    }
}

fn round1(x: f32) -> f32 {
    (x * 10.0).round() / 10.0
}

/// Tag overlap: `tag_scale * sqrt(sum of matched positive group weights)`, capped.
/// A keyword that is a substring of a keyword already matched (e.g. "coding"
/// after "ai coding") does not count again.
fn tag_score(
    meta: &Metadata,
    keywords: &KeywordConfig,
    cfg: &ScoringConfig,
    reasons: &mut Vec<String>,
) -> f32 {
    if meta.tags.is_empty() {
        return 0.0;
    }
    let tags_text = meta
        .tags
        .iter()
        .map(|t| t.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ");

    let mut matched: Vec<&str> = Vec::new();
    let mut raw = 0i32;
    for (group_name, group) in keywords.positive_groups() {
        let hit = group.keywords.iter().find(|kw| {
            tags_text.contains(kw.as_str())
                && !matched.iter().any(|m| *m != kw.as_str() && m.contains(kw.as_str()))
        });
        if let Some(kw) = hit {
            raw += group.weight;
            matched.push(kw.as_str());
            reasons.push(format!("tag:{group_name}:{kw}"));
        }
    }
    if raw <= 0 {
        return 0.0;
    }
    (cfg.tag_scale * (raw as f32).sqrt()).min(cfg.tag_max)
}

fn duration_score(duration: Option<u64>, cfg: &ScoringConfig) -> f32 {
    let Some(d) = duration else {
        return 0.0;
    };
    if d >= cfg.duration_min_secs && d <= cfg.duration_max_secs {
        cfg.duration_max
    } else if d < cfg.duration_min_secs {
        // ramps up towards the window; min_secs > 0 here since d < min
        cfg.duration_max * cfg.duration_partial * (d as f32 / cfg.duration_min_secs as f32)
    } else {
        cfg.duration_max * cfg.duration_partial
    }
}

/// Positive keyword hits per 100 words of title + description.
fn density_score(text: &str, keywords: &KeywordConfig, cfg: &ScoringConfig) -> f32 {
    let text = text.to_lowercase();
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    let hits: usize = keywords
        .positive_groups()
        .flat_map(|(_, g)| g.keywords.iter())
        .map(|kw| text.matches(kw.as_str()).count())
        .sum();
    let per_100 = hits as f32 / words as f32 * 100.0;
    (per_100 * cfg.density_scale).min(cfg.density_max)
}

fn social_score(meta: &Metadata, cfg: &ScoringConfig) -> f32 {
    let views = meta.view_count.unwrap_or(0);
    let likes = meta.like_count.unwrap_or(0);
    let view_pts = match views {
        v if v >= 100_000 => 0.6,
        v if v >= 25_000 => 0.4,
        v if v >= 5_000 => 0.2,
        v if v >= 500 => 0.1,
        _ => 0.0,
    };
    let engagement = if views > 0 {
        let ratio = likes as f64 / views as f64;
        if ratio > 0.04 {
            0.4
        } else if ratio > 0.02 {
            0.2
        } else {
            0.0
        }
    } else {
        0.0
    };
    ((view_pts + engagement) as f32).min(cfg.social_max)
}

/// Full `chapters_max` at five or more chapters, half at three or four.
fn chapters_score(meta: &Metadata, cfg: &ScoringConfig) -> f32 {
    match meta.chapter_count {
        n if n >= 5 => cfg.chapters_max,
        3 | 4 => cfg.chapters_max * 0.5,
        _ => 0.0,
    }
}

/// Pure function of (item, metadata, keywords, weights).
pub fn score(
    item: &Item,
    meta: &Metadata,
    keywords: &KeywordConfig,
    cfg: &ScoringConfig,
) -> Stage2Result {
    let mut reasons = Vec::new();
    let mut b = ScoreBreakdown::default();

    let title = meta.title.as_deref().unwrap_or(&item.title);
    let description = meta
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .unwrap_or(&item.description);

    b.tag = tag_score(meta, keywords, cfg, &mut reasons);

    b.duration = duration_score(meta.duration_secs, cfg);
    if let Some(d) = meta.duration_secs {
        reasons.push(format!("duration={:.2}({d}s)", b.duration));
    }

    b.density = density_score(&format!("{title} {description}"), keywords, cfg);
    if b.density > 0.0 {
        reasons.push(format!("density={:.2}", b.density));
    }

    let category = meta
        .source_category
        .as_deref()
        .unwrap_or(&item.source_category);
    if cfg
        .priority_categories
        .iter()
        .any(|c| c.eq_ignore_ascii_case(category))
    {
        b.category = cfg.category_boost;
        reasons.push(format!("category:{category}"));
    }

    b.social = social_score(meta, cfg);
    if b.social > 0.0 {
        reasons.push(format!("social={:.2}", b.social));
    }

    b.chapters = chapters_score(meta, cfg);
    if b.chapters > 0.0 {
        reasons.push(format!("chapters={:.2}({})", b.chapters, meta.chapter_count));
    }

    let mut subtotal = b.tag + b.duration + b.density + b.category + b.social + b.chapters;

    b.short_cap = match meta.duration_secs {
        Some(d) if d < 120 => Some(cfg.short_cap_under_2min),
        Some(d) if d < 180 => Some(cfg.short_cap_2_to_3min),
        _ => None,
    };
    if let Some(cap) = b.short_cap {
        subtotal = subtotal.min(cap);
        reasons.push(format!("short_cap={cap}"));
    }

    let neg_text = format!(
        "{} {} {}",
        title.to_lowercase(),
        meta.tags.join(" ").to_lowercase(),
        description.to_lowercase()
    );
    for (_, group) in keywords.negative_groups() {
        if let Some(kw) = group.keywords.iter().find(|kw| neg_text.contains(kw.as_str())) {
            b.negative_penalty += cfg.negative_penalty;
            reasons.push(format!("neg:{kw}"));
        }
    }

    b.total = round1((subtotal - b.negative_penalty).clamp(0.0, MAX_SCORE));
    Stage2Result {
        item: item.clone(),
        score: b.total,
        breakdown: b,
        reasons,
    }
}
