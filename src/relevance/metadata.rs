// src/relevance/metadata.rs
//! Per-item metadata used by Stage 2, and the `yt-dlp` backed lookup.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::ingest::types::Item;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    pub title: Option<String>,
    pub duration_secs: Option<u64>,
    pub tags: Vec<String>,
    /// Full description (the feed's copy is truncated).
    pub description: Option<String>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub chapter_count: usize,
    /// Overrides the item's source category when present.
    pub source_category: Option<String>,
}

/// External metadata collaborator. May fail per item.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn fetch_metadata(&self, item: &Item) -> Result<Metadata>;
}

#[derive(Debug, Default, Deserialize)]
struct YtDlpJson {
    title: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    tags: Option<Vec<String>>,
    description: Option<String>,
    view_count: Option<u64>,
    like_count: Option<u64>,
    #[serde(default)]
    chapters: Option<Vec<serde_json::Value>>,
}

impl From<YtDlpJson> for Metadata {
    fn from(j: YtDlpJson) -> Self {
        Metadata {
            title: j.title,
            duration_secs: j
                .duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.round() as u64),
            tags: j.tags.unwrap_or_default(),
            description: j.description,
            view_count: j.view_count,
            like_count: j.like_count,
            chapter_count: j.chapters.map(|c| c.len()).unwrap_or(0),
            source_category: None,
        }
    }
}

/// Parse one `yt-dlp --dump-json` document.
pub fn parse_ytdlp_json(raw: &str) -> Result<Metadata> {
    let j: YtDlpJson = serde_json::from_str(raw.trim()).context("decoding yt-dlp json")?;
    Ok(j.into())
}

/// Runs `<command> --dump-json --skip-download --no-warnings <url>` with a timeout.
#[derive(Debug, Clone)]
pub struct YtDlpLookup {
    command: String,
    timeout: Duration,
}

impl YtDlpLookup {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl MetadataLookup for YtDlpLookup {
    async fn fetch_metadata(&self, item: &Item) -> Result<Metadata> {
        if item.url.trim().is_empty() {
            return Err(anyhow!("item `{}` has no url", item.id));
        }
        let mut cmd = Command::new(&self.command);
        cmd.args(["--dump-json", "--skip-download", "--no-warnings", item.url.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("{} timed out after {:?}", self.command, self.timeout))?
            .with_context(|| format!("spawning {}", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let head: String = stderr.trim().chars().take(200).collect();
            return Err(anyhow!(
                "{} exited with {:?}: {head}",
                self.command,
                output.status.code()
            ));
        }
        parse_ytdlp_json(&String::from_utf8_lossy(&output.stdout))
    }
}
