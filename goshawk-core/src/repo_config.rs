//! Per-repository review configuration.
//!
//! Repositories may carry a `.goshawk.toml` at the root; it is fetched at
//! each review's base commit. Missing or malformed documents fall back
//! silently to defaults — a broken config file must never block a review.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::finding::Severity;

/// Name of the configuration document at the repository root.
pub const REPO_CONFIG_PATH: &str = ".goshawk.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepoConfig {
    pub review: ReviewSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewSection {
    /// Master switch; when false the review is skipped entirely.
    pub enabled: bool,
    /// Whether the style stage (S4) runs.
    pub style: bool,
    /// Minimum severity a finding needs to be posted.
    pub severity_threshold: Severity,
    /// Globs appended to the gatekeeper's non-reviewable set for this repo.
    pub ignore_patterns: Vec<String>,
    /// Per-language enable/disable map; absent languages default to enabled.
    pub language_rules: BTreeMap<String, bool>,
    /// Free-form prose injected into the style stage's prompt.
    pub custom_guidelines: Option<String>,
}

impl Default for ReviewSection {
    fn default() -> Self {
        ReviewSection {
            enabled: true,
            style: true,
            severity_threshold: Severity::Info,
            ignore_patterns: Vec::new(),
            language_rules: BTreeMap::new(),
            custom_guidelines: None,
        }
    }
}

impl Default for RepoConfig {
    fn default() -> Self {
        RepoConfig {
            review: ReviewSection::default(),
        }
    }
}

impl RepoConfig {
    /// Parse a configuration document, falling back to defaults on any
    /// parse failure.
    pub fn parse(content: &str) -> RepoConfig {
        match toml::from_str::<RepoConfig>(content) {
            Ok(config) => config,
            Err(err) => {
                debug!(error = %err, "malformed repo config, using defaults");
                RepoConfig::default()
            }
        }
    }

    /// Whether the given language is enabled for review.
    pub fn language_enabled(&self, language: Option<&str>) -> bool {
        match language {
            Some(lang) => self.review.language_rules.get(lang).copied().unwrap_or(true),
            None => true,
        }
    }
}
