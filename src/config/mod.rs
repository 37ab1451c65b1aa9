// src/config/mod.rs
//! Configuration bundle: main config + keyword groups + feed sources.
//!
//! Loaded once per cycle and treated as read-only input by the core.

pub mod app;
pub mod keywords;
pub mod sources;

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub use app::AppConfig;
pub use keywords::{KeywordConfig, KeywordGroup};
pub use sources::{SourceConfig, SourcesFile};

pub const DEFAULT_CONFIG_PATH: &str = "config/feedgate.toml";
pub const ENV_CONFIG_PATH: &str = "FEEDGATE_CONFIG";

#[derive(Debug, Clone)]
pub struct ConfigBundle {
    pub path: PathBuf,
    pub app: AppConfig,
    pub keywords: KeywordConfig,
    pub sources: Vec<SourceConfig>,
}

/// Resolve the main config path:
/// 1) explicit path (CLI flag)
/// 2) $FEEDGATE_CONFIG
/// 3) config/feedgate.toml
pub fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
        let pb = PathBuf::from(p);
        if pb.exists() {
            return Ok(pb);
        }
        return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
    }
    Ok(PathBuf::from(DEFAULT_CONFIG_PATH))
}

impl ConfigBundle {
    /// Read and validate all three files. Relative keyword/source paths resolve
    /// against the main config's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        let mut app = AppConfig::from_toml_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        app.apply_env_overrides();
        app.validate()
            .with_context(|| format!("validating config {}", path.display()))?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let keywords_path = resolve_relative(base, &app.paths.keywords);
        let sources_path = resolve_relative(base, &app.paths.sources);

        let kw_content = fs::read_to_string(&keywords_path)
            .with_context(|| format!("reading keywords from {}", keywords_path.display()))?;
        let keywords = KeywordConfig::from_toml_str(&kw_content)
            .with_context(|| format!("parsing keywords {}", keywords_path.display()))?;

        let src_content = fs::read_to_string(&sources_path)
            .with_context(|| format!("reading sources from {}", sources_path.display()))?;
        let sources = SourcesFile::from_toml_str(&src_content)
            .with_context(|| format!("parsing sources {}", sources_path.display()))?
            .sources;

        if sources.is_empty() {
            tracing::warn!(path = %sources_path.display(), "no feed sources configured");
        }

        Ok(Self {
            path: path.to_path_buf(),
            app,
            keywords,
            sources,
        })
    }
}

fn resolve_relative(base: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
