//! Deduplication and size filtering of fetched candidates.
//!
//! Rules are applied in a fixed precedence, first match wins:
//! 1. no usable URL → `no_url`
//! 2. URL seen before → `dup_url` (recorded at the check, before fetching)
//! 3. fetch returned no (or empty) bytes → `http_<status>`
//! 4. content hash seen before → `dup_hash` (recorded at the check)
//! 5. decodable and below the minimum size → `too_small`
//! 6. otherwise accepted
//!
//! Both sets only grow during a run. Each check-then-insert runs under one
//! lock acquisition, so concurrent workers cannot both claim the same key.

use crate::model::{CandidateRecord, DownloadOutcome, SkipReason};
use crate::traits::FetchResponse;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Mutex, PoisonError};

/// Run-scoped membership sets. Created empty, never persisted.
#[derive(Debug, Default)]
pub struct DedupState {
    seen_urls: HashSet<String>,
    seen_hashes: HashSet<String>,
}

impl DedupState {
    /// Records `url`; returns `false` if it was already present.
    pub fn record_url(&mut self, url: &str) -> bool {
        self.seen_urls.insert(url.to_string())
    }

    /// Records `hash`; returns `false` if it was already present.
    pub fn record_hash(&mut self, hash: &str) -> bool {
        self.seen_hashes.insert(hash.to_string())
    }

    pub fn url_count(&self) -> usize {
        self.seen_urls.len()
    }

    pub fn hash_count(&self) -> usize {
        self.seen_hashes.len()
    }
}

/// Content that passed every rule and may be written to disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub sha256: String,
    pub dims: Option<(u32, u32)>,
}

pub struct ContentGate {
    min_width: u32,
    min_height: u32,
    state: Mutex<DedupState>,
}

impl ContentGate {
    pub fn new(min_width: u32, min_height: u32) -> Self {
        Self {
            min_width,
            min_height,
            state: Mutex::new(DedupState::default()),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DedupState) -> T) -> T {
        // The sets stay consistent even if a holder panicked mid-insert.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    /// Rules 1 and 2. On success the URL is claimed for this run and the
    /// caller may fetch it.
    pub fn claim<'a>(&self, candidate: &'a CandidateRecord) -> Result<&'a str, DownloadOutcome> {
        let url = candidate
            .url()
            .ok_or_else(|| DownloadOutcome::skip(SkipReason::NoUrl))?;
        if self.with_state(|s| s.record_url(url)) {
            Ok(url)
        } else {
            Err(DownloadOutcome::skip(SkipReason::DupUrl))
        }
    }

    /// Rules 3 to 6, applied to the result of fetching a claimed URL.
    pub fn admit(&self, response: FetchResponse) -> Result<Admitted, DownloadOutcome> {
        let Some(bytes) = response.bytes.filter(|b| !b.is_empty()) else {
            return Err(DownloadOutcome::skip(SkipReason::Http(response.status)));
        };

        let sha256 = sha256_hex(&bytes);
        let dims = measure_dimensions(&bytes);

        if !self.with_state(|s| s.record_hash(&sha256)) {
            return Err(DownloadOutcome::skip(SkipReason::DupHash).with_content(sha256, dims));
        }

        if let Some((w, h)) = dims {
            if w < self.min_width || h < self.min_height {
                return Err(DownloadOutcome::skip(SkipReason::TooSmall).with_content(sha256, dims));
            }
        }

        Ok(Admitted {
            bytes,
            content_type: response.content_type,
            sha256,
            dims,
        })
    }

    /// `(seen urls, seen hashes)`
    pub fn counts(&self) -> (usize, usize) {
        self.with_state(|s| (s.url_count(), s.hash_count()))
    }
}

/// Lower-case hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Reads width and height from the image header only.
///
/// Returns `None` for unrecognised or corrupt data.
pub fn measure_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}
