//! Run configuration and credential loading.

use crate::harvest::traits::ConfigError;
use crate::traits::LicenseFilter;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the provider API key.
pub const CREDENTIAL_ENV: &str = "FLICKR_API_KEY";

/// Settings for one harvest run.
#[derive(Debug, Clone)]
pub struct HarvestConfig {
    /// Search terms, processed sequentially
    pub queries: Vec<String>,

    /// Directory receiving image files and both manifest logs
    pub out_dir: PathBuf,

    /// Class label stamped on every row of this run; one of `classes`
    pub label: String,

    /// The two dataset classes, positive first
    pub classes: [String; 2],

    /// Per-query result cap
    pub limit: usize,

    pub min_width: u32,
    pub min_height: u32,

    /// Maximum simultaneously in-flight per-candidate pipelines
    pub concurrency: usize,

    /// Maximum simultaneous connections to one remote host
    pub per_host: usize,

    pub license: LicenseFilter,

    /// Shared stem of `<prefix>.csv` and `<prefix>.jsonl`
    pub manifest_prefix: String,

    /// Pause between two queries of the search phase
    pub query_pause: Duration,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            queries: Vec::new(),
            out_dir: PathBuf::from("data/raw"),
            label: String::new(),
            classes: ["smiski".to_string(), "non_smiski".to_string()],
            limit: 500,
            min_width: 256,
            min_height: 256,
            concurrency: 16,
            per_host: 8,
            license: LicenseFilter::Any,
            manifest_prefix: "download_manifest".to_string(),
            query_pause: Duration::from_millis(1000),
        }
    }
}

impl HarvestConfig {
    /// Checks the settings without touching the filesystem or network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queries.iter().all(|q| q.trim().is_empty()) {
            return Err(ConfigError::Invalid("at least one query is required".into()));
        }
        let [positive, negative] = &self.classes;
        if positive.trim().is_empty() || negative.trim().is_empty() {
            return Err(ConfigError::Invalid("class names must not be blank".into()));
        }
        if positive.trim() == negative.trim() {
            return Err(ConfigError::Invalid(format!(
                "positive and negative class are both '{}'",
                positive.trim()
            )));
        }
        if !self.is_class(&self.label) {
            return Err(ConfigError::Invalid(format!(
                "label '{}' must be '{}' or '{}'",
                self.label,
                positive.trim(),
                negative.trim()
            )));
        }
        if self.limit == 0 {
            return Err(ConfigError::Invalid("limit must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(ConfigError::Invalid("concurrency must be at least 1".into()));
        }
        if self.per_host == 0 {
            return Err(ConfigError::Invalid("per-host limit must be at least 1".into()));
        }
        let prefix = self.manifest_prefix.trim();
        if prefix.is_empty() || prefix.contains(['/', '\\']) {
            return Err(ConfigError::Invalid(format!(
                "manifest prefix '{}' must be a plain file stem",
                self.manifest_prefix
            )));
        }
        Ok(())
    }

    /// Whether `label` names one of the two dataset classes.
    pub fn is_class(&self, label: &str) -> bool {
        let label = label.trim();
        !label.is_empty() && self.classes.iter().any(|c| c.trim() == label)
    }

    /// Non-blank queries, trimmed, in the order given.
    pub fn search_queries(&self) -> impl Iterator<Item = &str> {
        self.queries.iter().map(|q| q.trim()).filter(|q| !q.is_empty())
    }

    pub fn csv_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.csv", self.manifest_prefix))
    }

    pub fn jsonl_path(&self) -> PathBuf {
        self.out_dir.join(format!("{}.jsonl", self.manifest_prefix))
    }
}

/// Reads the API key from the process environment.
pub fn credential_from_env() -> Result<String, ConfigError> {
    credential_from(|name| std::env::var(name).ok())
}

/// Reads the API key through `lookup`; a blank value counts as missing.
pub fn credential_from<F>(lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(CREDENTIAL_ENV)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingCredential(CREDENTIAL_ENV))
}
