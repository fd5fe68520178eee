use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One image discovered by a provider search. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_url: String,
    pub page_url: String,
    pub license: Option<String>,
    /// Provider-reported size hints, not trusted for filtering.
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Search term that produced this candidate
    pub query: String,
    pub provider: String, // e.g., "flickr"
}

impl CandidateRecord {
    /// Returns the source URL when it is usable for a fetch.
    pub fn url(&self) -> Option<&str> {
        let url = self.source_url.trim();
        (!url.is_empty()).then_some(url)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Ok,
    Skip,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Ok => "ok",
            OutcomeStatus::Skip => "skip",
        }
    }
}

/// Why a candidate did not produce an image file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SkipReason {
    NoUrl,
    DupUrl,
    /// Fetch failed; `-1` for transport errors and timeouts.
    Http(i32),
    DupHash,
    TooSmall,
    WriteError,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoUrl => f.write_str("no_url"),
            SkipReason::DupUrl => f.write_str("dup_url"),
            SkipReason::Http(code) => write!(f, "http_{}", code),
            SkipReason::DupHash => f.write_str("dup_hash"),
            SkipReason::TooSmall => f.write_str("too_small"),
            SkipReason::WriteError => f.write_str("write_error"),
        }
    }
}

/// Result of running one candidate through fetch and the content gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    pub status: OutcomeStatus,
    /// Set iff `status` is `Skip`
    pub reason: Option<SkipReason>,
    /// Set iff `status` is `Ok`
    pub filepath: Option<PathBuf>,
    /// Set iff bytes were fetched
    pub sha256: Option<String>,
    pub measured_width: Option<u32>,
    pub measured_height: Option<u32>,
}

impl DownloadOutcome {
    pub fn skip(reason: SkipReason) -> Self {
        Self {
            status: OutcomeStatus::Skip,
            reason: Some(reason),
            filepath: None,
            sha256: None,
            measured_width: None,
            measured_height: None,
        }
    }

    pub fn accepted(filepath: PathBuf, sha256: String, dims: Option<(u32, u32)>) -> Self {
        Self {
            status: OutcomeStatus::Ok,
            reason: None,
            filepath: Some(filepath),
            sha256: Some(sha256),
            measured_width: dims.map(|(w, _)| w),
            measured_height: dims.map(|(_, h)| h),
        }
    }

    /// Attaches what was learned from the fetched bytes to a skip.
    pub fn with_content(mut self, sha256: String, dims: Option<(u32, u32)>) -> Self {
        self.sha256 = Some(sha256);
        self.measured_width = dims.map(|(w, _)| w);
        self.measured_height = dims.map(|(_, h)| h);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status == OutcomeStatus::Ok
    }
}

/// One persisted manifest entry.
///
/// The first thirteen fields are the tabular columns, in order. The measured
/// size only appears in the line-oriented log, and only when it was read from
/// the fetched bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestRow {
    pub id: String,
    pub label: String,
    pub query: String,
    pub provider: String,
    pub source_url: String,
    pub page_url: String,
    pub license: Option<String>,
    pub filepath: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub sha256: Option<String>,
    pub status: OutcomeStatus,
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measured_height: Option<u32>,
}

impl ManifestRow {
    pub const COLUMNS: [&'static str; 13] = [
        "id",
        "label",
        "query",
        "provider",
        "source_url",
        "page_url",
        "license",
        "filepath",
        "width",
        "height",
        "sha256",
        "status",
        "reason",
    ];

    /// Joins a candidate, its identifier, the run label and its outcome.
    ///
    /// Measured dimensions win over the provider's hints.
    pub fn new(id: String, label: &str, candidate: &CandidateRecord, outcome: &DownloadOutcome) -> Self {
        Self {
            id,
            label: label.to_string(),
            query: candidate.query.clone(),
            provider: candidate.provider.clone(),
            source_url: candidate.source_url.clone(),
            page_url: candidate.page_url.clone(),
            license: candidate.license.clone(),
            filepath: outcome
                .filepath
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            width: outcome.measured_width.or(candidate.width),
            height: outcome.measured_height.or(candidate.height),
            sha256: outcome.sha256.clone(),
            status: outcome.status,
            reason: outcome.reason.map(|r| r.to_string()),
            measured_width: outcome.measured_width,
            measured_height: outcome.measured_height,
        }
    }

    /// Cell values in [`ManifestRow::COLUMNS`] order; absent values are empty.
    pub fn cells(&self) -> [String; 13] {
        let opt = |v: &Option<String>| v.clone().unwrap_or_default();
        let num = |v: Option<u32>| v.map(|n| n.to_string()).unwrap_or_default();
        [
            self.id.clone(),
            self.label.clone(),
            self.query.clone(),
            self.provider.clone(),
            self.source_url.clone(),
            self.page_url.clone(),
            opt(&self.license),
            opt(&self.filepath),
            num(self.width),
            num(self.height),
            opt(&self.sha256),
            self.status.as_str().to_string(),
            opt(&self.reason),
        ]
    }
}
