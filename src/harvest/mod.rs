//! Harvest module - image discovery, download and manifest pipeline.
//!
//! This module provides the components of a harvest run:
//! - **Provider**: paginated Flickr search via [`FlickrProvider`]
//! - **Fetcher**: single-attempt HTTP download via [`HttpFetcher`]
//! - **Gate**: URL/content deduplication and size filtering via [`ContentGate`]
//! - **Manifest**: append-only CSV + JSONL ledger via [`ManifestWriter`]
//! - **Pipeline**: the two-phase orchestrator [`HarvestPipeline`]

pub mod fetcher;
pub mod gate;
pub mod manifest;
pub mod pipeline;
pub mod provider;
pub mod traits;

// Re-export commonly used types
pub use traits::{ConfigError, ManifestError, PipelineError, ProviderError};

pub use fetcher::{HostLimiter, HttpFetcher};
pub use gate::{Admitted, ContentGate, DedupState};
pub use manifest::{read_manifest, ManifestWriter};
pub use pipeline::{process_candidate, HarvestPipeline, HarvestResult, HarvestStats};
pub use provider::{FlickrProvider, Throttle};
