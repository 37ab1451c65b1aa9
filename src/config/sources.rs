// src/config/sources.rs
use anyhow::{anyhow, Result};
use serde::Deserialize;

/// One monitored feed. Either `channel_id` (YouTube channel) or an explicit `url`.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    "secondary".into()
}

impl SourceConfig {
    pub fn feed_url(&self) -> Result<String> {
        if let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }
        match self.channel_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(youtube_feed_url(id)),
            _ => Err(anyhow!("source `{}` needs either `url` or `channel_id`", self.name)),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl SourcesFile {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let file: SourcesFile = toml::from_str(s)?;
        for src in &file.sources {
            // surface misconfigured entries at load time, not mid-cycle
            src.feed_url()?;
        }
        Ok(file)
    }
}

pub fn youtube_feed_url(channel_id: &str) -> String {
    format!("https://www.youtube.com/feeds/videos.xml?channel_id={channel_id}")
}

pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}
