//! Error taxonomy for the harvest run.
//!
//! Per-candidate failures are not errors: they become
//! [`SkipReason`](crate::model::SkipReason) values in the manifest. The enums
//! here cover what can stop a page, a log, or a whole run.

use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Errors raised before any side effect; the binary exits with status 2.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Provider credential is not set in the environment
    #[error("Missing credential: environment variable {0} is not set")]
    MissingCredential(&'static str),

    /// A setting failed validation
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of one provider page request. Ends pagination for that query only.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// Provider answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Provider answered 200 but reported a failure in the payload
    #[error("Provider reported failure: {0}")]
    Api(String),

    /// Request never completed (connect, timeout, body read)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Payload was not the expected JSON
    #[error("Malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Failure to append to one of the manifest logs.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Log file could not be opened or written
    #[error("Manifest I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Row could not be encoded as JSON
    #[error("Failed to encode manifest row: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Run-level failures of the harvest pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Settings are invalid, or the existing manifest holds another class
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Output directory could not be created
    #[error("Cannot create output directory '{path}': {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest could not be opened or appended
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// Some download workers died before finishing
    #[error("{0} download worker(s) aborted")]
    WorkersAborted(usize),
}
