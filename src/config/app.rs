// src/config/app.rs
//! Main runtime configuration (`config/feedgate.toml`).
//!
//! Every section is optional; missing keys fall back to the defaults below.

use serde::Deserialize;
use std::path::PathBuf;

pub const ENV_STAGE2_THRESHOLD: &str = "FEEDGATE_STAGE2_THRESHOLD";

/// Upper bound of the Stage 2 score range.
pub const MAX_SCORE: f32 = 10.0;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_items_per_poll")]
    pub max_items_per_poll: usize,
    #[serde(default = "default_feed_timeout_secs")]
    pub feed_timeout_secs: u64,
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_items_per_poll: default_max_items_per_poll(),
            feed_timeout_secs: default_feed_timeout_secs(),
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_interval_secs() -> u64 {
    1800
}
fn default_max_items_per_poll() -> usize {
    10
}
fn default_feed_timeout_secs() -> u64 {
    15
}
fn default_max_age_days() -> i64 {
    7
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_stage1_min_score")]
    pub stage1_min_score: i32,
    /// A single matched group at or above this weight passes Stage 1 on its own.
    #[serde(default)]
    pub stage1_high_weight: Option<i32>,
    #[serde(default = "default_stage2_min_score")]
    pub stage2_min_score: f32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            stage1_min_score: default_stage1_min_score(),
            stage1_high_weight: None,
            stage2_min_score: default_stage2_min_score(),
        }
    }
}

fn default_stage1_min_score() -> i32 {
    2
}
fn default_stage2_min_score() -> f32 {
    6.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct BudgetConfig {
    #[serde(default = "default_daily_limit_usd")]
    pub daily_limit_usd: f64,
    /// Amount reserved ahead of every dispatch; also handed to the pipeline as its cap.
    #[serde(default = "default_per_item_usd")]
    pub per_item_usd: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: default_daily_limit_usd(),
            per_item_usd: default_per_item_usd(),
        }
    }
}

fn default_daily_limit_usd() -> f64 {
    10.0
}
fn default_per_item_usd() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_dispatch_command")]
    pub command: String,
    /// Argument template. Placeholders: `{id}`, `{url}`, `{title}`, `{score}`, `{budget}`.
    #[serde(default = "default_dispatch_args")]
    pub args: Vec<String>,
    #[serde(default = "default_dispatch_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            command: default_dispatch_command(),
            args: default_dispatch_args(),
            timeout_secs: default_dispatch_timeout_secs(),
            working_dir: None,
        }
    }
}

fn default_dispatch_command() -> String {
    "./pipeline.sh".into()
}
fn default_dispatch_args() -> Vec<String> {
    vec!["{url}".into(), "{budget}".into()]
}
fn default_dispatch_timeout_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_metadata_command")]
    pub command: String,
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            command: default_metadata_command(),
            timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

fn default_metadata_command() -> String {
    "yt-dlp".into()
}
fn default_metadata_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

impl StateConfig {
    pub fn ledger_path(&self) -> PathBuf {
        self.dir.join("processed.json")
    }

    pub fn budget_path(&self) -> PathBuf {
        self.dir.join("budget.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join("feedgate.lock")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_keywords_path")]
    pub keywords: PathBuf,
    #[serde(default = "default_sources_path")]
    pub sources: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            keywords: default_keywords_path(),
            sources: default_sources_path(),
        }
    }
}

fn default_keywords_path() -> PathBuf {
    PathBuf::from("keywords.toml")
}
fn default_sources_path() -> PathBuf {
    PathBuf::from("sources.toml")
}

/// Stage 2 weights. Each component is capped on its own before summing.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_tag_max")]
    pub tag_max: f32,
    #[serde(default = "default_tag_scale")]
    pub tag_scale: f32,
    #[serde(default = "default_duration_max")]
    pub duration_max: f32,
    #[serde(default = "default_duration_min_secs")]
    pub duration_min_secs: u64,
    #[serde(default = "default_duration_max_secs")]
    pub duration_max_secs: u64,
    /// Fraction of `duration_max` granted outside the window.
    #[serde(default = "default_duration_partial")]
    pub duration_partial: f32,
    #[serde(default = "default_density_max")]
    pub density_max: f32,
    #[serde(default = "default_density_scale")]
    pub density_scale: f32,
    #[serde(default = "default_category_boost")]
    pub category_boost: f32,
    #[serde(default = "default_priority_categories")]
    pub priority_categories: Vec<String>,
    #[serde(default = "default_social_max")]
    pub social_max: f32,
    #[serde(default = "default_chapters_max")]
    pub chapters_max: f32,
    #[serde(default = "default_negative_penalty")]
    pub negative_penalty: f32,
    #[serde(default = "default_short_cap_under_2min")]
    pub short_cap_under_2min: f32,
    #[serde(default = "default_short_cap_2_to_3min")]
    pub short_cap_2_to_3min: f32,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            tag_max: default_tag_max(),
            tag_scale: default_tag_scale(),
            duration_max: default_duration_max(),
            duration_min_secs: default_duration_min_secs(),
            duration_max_secs: default_duration_max_secs(),
            duration_partial: default_duration_partial(),
            density_max: default_density_max(),
            density_scale: default_density_scale(),
            category_boost: default_category_boost(),
            priority_categories: default_priority_categories(),
            social_max: default_social_max(),
            chapters_max: default_chapters_max(),
            negative_penalty: default_negative_penalty(),
            short_cap_under_2min: default_short_cap_under_2min(),
            short_cap_2_to_3min: default_short_cap_2_to_3min(),
        }
    }
}

fn default_tag_max() -> f32 {
    4.0
}
fn default_tag_scale() -> f32 {
    2.0
}
fn default_duration_max() -> f32 {
    2.5
}
fn default_duration_min_secs() -> u64 {
    600
}
fn default_duration_max_secs() -> u64 {
    10_800
}
fn default_duration_partial() -> f32 {
    0.4
}
fn default_density_max() -> f32 {
    1.5
}
fn default_density_scale() -> f32 {
    0.5
}
fn default_category_boost() -> f32 {
    1.0
}
fn default_priority_categories() -> Vec<String> {
    vec!["primary".into()]
}
fn default_social_max() -> f32 {
    0.75
}
fn default_chapters_max() -> f32 {
    0.5
}
fn default_negative_penalty() -> f32 {
    2.0
}
fn default_short_cap_under_2min() -> f32 {
    3.5
}
fn default_short_cap_2_to_3min() -> f32 {
    5.0
}

// parse optional float env and clamp to <0.0..=MAX_SCORE>
pub(crate) fn parse_threshold_env(raw: Option<String>) -> Option<f32> {
    raw.and_then(|s| s.trim().parse::<f32>().ok())
        .filter(|v| v.is_finite())
        .map(|v| v.clamp(0.0, MAX_SCORE))
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(s)?;
        Ok(cfg)
    }

    /// Apply env overrides (currently only the Stage 2 threshold).
    pub fn apply_env_overrides(&mut self) {
        if let Some(t) = parse_threshold_env(std::env::var(ENV_STAGE2_THRESHOLD).ok()) {
            self.thresholds.stage2_min_score = t;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.polling.interval_secs == 0 {
            anyhow::bail!("polling.interval_secs must be > 0");
        }
        if !(self.budget.daily_limit_usd.is_finite() && self.budget.daily_limit_usd >= 0.0) {
            anyhow::bail!("budget.daily_limit_usd must be a non-negative number");
        }
        if !(self.budget.per_item_usd.is_finite() && self.budget.per_item_usd > 0.0) {
            anyhow::bail!("budget.per_item_usd must be > 0");
        }
        if !(0.0..=MAX_SCORE).contains(&self.thresholds.stage2_min_score) {
            anyhow::bail!(
                "thresholds.stage2_min_score must be within 0..={MAX_SCORE}, got {}",
                self.thresholds.stage2_min_score
            );
        }
        if self.dispatch.command.trim().is_empty() {
            anyhow::bail!("dispatch.command must not be empty");
        }
        if self.dispatch.timeout_secs == 0 {
            anyhow::bail!("dispatch.timeout_secs must be > 0");
        }
        if self.scoring.duration_min_secs > self.scoring.duration_max_secs {
            anyhow::bail!("scoring.duration_min_secs must not exceed duration_max_secs");
        }
        Ok(())
    }
}
