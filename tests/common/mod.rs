// tests/common/mod.rs
// Deterministic fakes for the three collaborators plus small builders.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use feedgate::budget::BudgetGuard;
use feedgate::config::{AppConfig, KeywordConfig};
use feedgate::dispatch::{ExitInfo, PipelineRunner};
use feedgate::ingest::types::{FeedSource, Item};
use feedgate::ledger::Ledger;
use feedgate::relevance::metadata::{Metadata, MetadataLookup};
use feedgate::scheduler::{Collaborators, Scheduler};

pub const KEYWORDS: &str = r#"
[keyword_groups.dark_factory]
weight = 3
keywords = ["dark factory", "autonomous agent", "software factory"]

[keyword_groups.ai_coding]
weight = 2
keywords = ["claude code", "copilot", "cursor"]

[keyword_groups.devops]
weight = 2
keywords = ["kubernetes", "docker", "ci/cd"]

[keyword_groups.enterprise]
weight = 1
keywords = ["developer productivity"]

[keyword_groups.negative]
weight = -3
keywords = ["minecraft", "gaming", "cooking"]
"#;

pub fn keywords() -> KeywordConfig {
    KeywordConfig::from_toml_str(KEYWORDS).unwrap()
}

/// Defaults plus the knobs the scenarios care about.
pub fn app_config(daily_cap: f64, per_item: f64) -> AppConfig {
    let mut app = AppConfig::default();
    app.budget.daily_limit_usd = daily_cap;
    app.budget.per_item_usd = per_item;
    app.thresholds.stage1_min_score = 2;
    app.thresholds.stage2_min_score = 6.0;
    app.dispatch.timeout_secs = 1;
    app.polling.interval_secs = 1;
    app
}

pub fn item(id: &str, title: &str, category: &str) -> Item {
    let now = Utc::now();
    Item {
        id: id.into(),
        title: title.into(),
        description: String::new(),
        url: format!("https://www.youtube.com/watch?v={id}"),
        source_name: "Fake Channel".into(),
        source_category: category.into(),
        published_at: Some(now - ChronoDuration::hours(1)),
        discovered_at: now,
    }
}

pub fn long_video(tags: &[&str]) -> Metadata {
    Metadata {
        duration_secs: Some(1800),
        tags: tags.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

pub fn short_video() -> Metadata {
    Metadata {
        duration_secs: Some(60),
        ..Default::default()
    }
}

pub struct FakeSource {
    name: String,
    result: Result<Vec<Item>, String>,
}

impl FakeSource {
    pub fn ok(name: &str, items: Vec<Item>) -> Self {
        Self {
            name: name.into(),
            result: Ok(items),
        }
    }

    pub fn failing(name: &str) -> Self {
        Self {
            name: name.into(),
            result: Err("connection refused".into()),
        }
    }
}

#[async_trait]
impl FeedSource for FakeSource {
    async fn list_new_items(&self) -> Result<Vec<Item>> {
        self.result.clone().map_err(|e| anyhow!(e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Item id → metadata. Unknown ids fail the lookup.
#[derive(Default)]
pub struct FakeMetadata {
    map: HashMap<String, Metadata>,
    pub lookups: Mutex<Vec<String>>,
}

impl FakeMetadata {
    pub fn with(mut self, id: &str, meta: Metadata) -> Self {
        self.map.insert(id.into(), meta);
        self
    }
}

#[async_trait]
impl MetadataLookup for FakeMetadata {
    async fn fetch_metadata(&self, item: &Item) -> Result<Metadata> {
        self.lookups.lock().push(item.id.clone());
        self.map
            .get(&item.id)
            .cloned()
            .ok_or_else(|| anyhow!("no metadata for {}", item.id))
    }
}

#[derive(Clone, Copy, Debug)]
pub enum Script {
    Exit(i32),
    Hang,
    SpawnError,
}

/// Scripted pipeline: exit 0 unless told otherwise. Records every call.
#[derive(Default)]
pub struct FakeRunner {
    scripts: Mutex<HashMap<String, Script>>,
    pub calls: Mutex<Vec<String>>,
    /// Fired after the first call returns, to simulate a stop signal mid-cycle.
    stop_after_first: Mutex<Option<watch::Sender<bool>>>,
}

impl FakeRunner {
    pub fn script(self, id: &str, s: Script) -> Self {
        self.scripts.lock().insert(id.into(), s);
        self
    }

    pub fn stop_after_first_call(self, tx: watch::Sender<bool>) -> Self {
        *self.stop_after_first.lock() = Some(tx);
        self
    }

    pub fn call_ids(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PipelineRunner for FakeRunner {
    async fn run(&self, item: &Item, _score: f32, _timeout: Duration) -> Result<ExitInfo> {
        self.calls.lock().push(item.id.clone());
        let script = self
            .scripts
            .lock()
            .get(&item.id)
            .copied()
            .unwrap_or(Script::Exit(0));
        let result = match script {
            Script::Exit(code) => Ok(ExitInfo {
                code: Some(code),
                ..Default::default()
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ExitInfo::default())
            }
            Script::SpawnError => Err(anyhow!("pipeline binary missing")),
        };
        if let Some(tx) = self.stop_after_first.lock().take() {
            let _ = tx.send(true);
        }
        result
    }
}

pub struct Harness {
    pub ledger: Arc<Ledger>,
    pub budget: Arc<BudgetGuard>,
    pub runner: Arc<FakeRunner>,
    pub metadata: Arc<FakeMetadata>,
}

impl Harness {
    pub fn new(app: &AppConfig, metadata: FakeMetadata, runner: FakeRunner) -> Self {
        Self {
            ledger: Arc::new(Ledger::in_memory()),
            budget: Arc::new(BudgetGuard::in_memory(app.budget.daily_limit_usd)),
            runner: Arc::new(runner),
            metadata: Arc::new(metadata),
        }
    }

    pub fn scheduler(&self, app: AppConfig, sources: Vec<Box<dyn FeedSource>>) -> Scheduler {
        Scheduler::new(
            app,
            keywords(),
            Collaborators {
                sources,
                metadata: self.metadata.clone(),
                runner: self.runner.clone(),
                ledger: self.ledger.clone(),
                budget: self.budget.clone(),
            },
        )
    }
}

/// A receiver that never sees a stop request.
pub fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}
