use crate::model::CandidateRecord;
use async_trait::async_trait;

/// License restriction passed through to the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LicenseFilter {
    #[default]
    Any,
    /// Only redistribution-permissive licenses
    Open,
}

#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Returns the provider tag stamped on every candidate (e.g., "flickr").
    fn provider_id(&self) -> &str;

    /// Searches for `query`, returning at most `limit` candidates.
    ///
    /// Pagination failures truncate the result instead of failing it, so this
    /// never errors.
    async fn search(&self, query: &str, limit: usize, license: LicenseFilter) -> Vec<CandidateRecord>;
}

/// Outcome of one download attempt. Failures are data, never errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResponse {
    pub bytes: Option<Vec<u8>>,
    pub content_type: Option<String>,
    /// HTTP status, or `-1` for transport errors and timeouts.
    pub status: i32,
}

impl FetchResponse {
    pub fn ok(bytes: Vec<u8>, content_type: Option<String>) -> Self {
        Self {
            bytes: Some(bytes),
            content_type,
            status: 200,
        }
    }

    pub fn failed(status: i32) -> Self {
        Self {
            bytes: None,
            content_type: None,
            status,
        }
    }
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Single attempt, no retries.
    async fn fetch(&self, url: &str) -> FetchResponse;
}
