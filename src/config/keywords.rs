// src/config/keywords.rs
//! Weighted keyword groups shared by both relevance stages.
//!
//! TOML shape:
//! ```toml
//! [keyword_groups.ai_coding]
//! weight = 2
//! keywords = ["claude code", "cursor", "copilot"]
//!
//! [keyword_groups.negative]
//! weight = -3
//! keywords = ["gaming", "minecraft"]
//! ```

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Deserialize)]
pub struct KeywordGroup {
    pub weight: i32,
    pub keywords: Vec<String>,
}

impl KeywordGroup {
    pub fn is_negative(&self) -> bool {
        self.weight < 0
    }
}

/// Group name → group. A `BTreeMap` keeps match reporting in a stable order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeywordConfig {
    #[serde(default)]
    pub keyword_groups: BTreeMap<String, KeywordGroup>,
}

impl KeywordConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        let mut cfg: KeywordConfig = toml::from_str(s)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Lowercase, trim, and drop empty keywords so matching can stay a plain `contains`.
    fn normalize(&mut self) {
        for group in self.keyword_groups.values_mut() {
            let mut cleaned: Vec<String> = group
                .keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            cleaned.dedup();
            group.keywords = cleaned;
        }
    }

    pub fn positive_groups(&self) -> impl Iterator<Item = (&String, &KeywordGroup)> {
        self.keyword_groups.iter().filter(|(_, g)| !g.is_negative())
    }

    pub fn negative_groups(&self) -> impl Iterator<Item = (&String, &KeywordGroup)> {
        self.keyword_groups.iter().filter(|(_, g)| g.is_negative())
    }
}
