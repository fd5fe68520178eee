//! Paginated image search against the Flickr REST API.
//!
//! Only metadata is returned here; bytes are fetched later by the
//! [`Fetcher`](crate::traits::Fetcher). A failing page ends pagination for
//! that query but keeps what earlier pages produced.

use crate::harvest::fetcher::{FETCH_TIMEOUT, USER_AGENT};
use crate::harvest::traits::ProviderError;
use crate::model::CandidateRecord;
use crate::traits::{ImageProvider, LicenseFilter};
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const FLICKR_ENDPOINT: &str = "https://api.flickr.com/services/rest/";

/// Records requested per page.
pub const PAGE_SIZE: usize = 250;

/// License codes sent when only open licenses are wanted.
pub const OPEN_LICENSES: &str = "1,2,3,4,5,6,7,8,9,10";

/// Size variants, largest first.
const SIZE_SUFFIXES: [&str; 4] = ["o", "l", "c", "m"];

/// Human-readable name of a Flickr license code.
pub fn license_name(code: &str) -> Option<&'static str> {
    Some(match code.trim() {
        "0" => "All Rights Reserved",
        "1" => "CC BY-NC-SA 2.0",
        "2" => "CC BY-NC 2.0",
        "3" => "CC BY-NC-ND 2.0",
        "4" => "CC BY 2.0",
        "5" => "CC BY-SA 2.0",
        "6" => "CC BY-ND 2.0",
        "7" => "No known copyright restrictions",
        "8" => "US Gov Work",
        "9" => "Public Domain",
        "10" => "CC0",
        _ => return None,
    })
}

// ============================================================================
// Throttle
// ============================================================================

/// Randomised pause between provider requests. Courtesy only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttle {
    pub base: Duration,
    pub jitter: Duration,
}

impl Throttle {
    pub const fn none() -> Self {
        Self {
            base: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// 300 ms plus up to 600 ms.
    pub const fn courtesy() -> Self {
        Self {
            base: Duration::from_millis(300),
            jitter: Duration::from_millis(600),
        }
    }

    pub fn next_delay(&self) -> Duration {
        let span = self.jitter.as_millis();
        if span == 0 {
            return self.base;
        }
        let extra = uuid::Uuid::new_v4().as_u128() % (span + 1);
        self.base + Duration::from_millis(extra as u64)
    }

    pub async fn pause(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Pagination
// ============================================================================

/// One page of search results.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Candidates with a usable URL
    pub entries: Vec<CandidateRecord>,
    /// Entries the provider returned, before dropping URL-less ones
    pub raw_count: usize,
    /// Page count reported by the provider
    pub total_pages: Option<usize>,
}

/// Requests pages `1..=ceil(limit / PAGE_SIZE)` through `fetch_page`.
///
/// Stops at the first failed page, at an empty page, past the provider's
/// last page, or once `limit` records are collected.
pub async fn paginate<F, Fut>(query: &str, limit: usize, throttle: Throttle, mut fetch_page: F) -> Vec<CandidateRecord>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Page, ProviderError>>,
{
    let pages = limit.div_ceil(PAGE_SIZE);
    let mut out = Vec::new();

    for page in 1..=pages {
        if page > 1 {
            throttle.pause().await;
        }

        let result = match fetch_page(page).await {
            Ok(result) => result,
            Err(e) => {
                warn!(query, page, "Search page failed, stopping pagination: {}", e);
                break;
            }
        };

        debug!(
            query,
            page,
            entries = result.entries.len(),
            raw = result.raw_count,
            "Search page fetched"
        );
        out.extend(result.entries);

        let last_page = result.total_pages.is_some_and(|total| page >= total);
        if result.raw_count == 0 || last_page || out.len() >= limit {
            break;
        }
    }

    out.truncate(limit);
    out
}

// ============================================================================
// Response mapping
// ============================================================================

fn as_u32(value: &Value) -> Option<u32> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First present `<field>_<size>` in largest-to-smallest order.
fn best<T>(photo: &Value, field: &str, parse: impl Fn(&Value) -> Option<T>) -> Option<T> {
    SIZE_SUFFIXES
        .iter()
        .find_map(|size| parse(&photo[format!("{}_{}", field, size).as_str()]))
}

/// Maps one raw photo entry; `None` when it has no usable URL.
pub fn map_photo(photo: &Value, query: &str) -> Option<CandidateRecord> {
    let source_url = best(photo, "url", as_text)?;
    let owner = as_text(&photo["owner"]).unwrap_or_default();
    let id = as_text(&photo["id"]).unwrap_or_default();

    Some(CandidateRecord {
        source_url,
        page_url: format!("https://www.flickr.com/photos/{}/{}", owner, id),
        license: as_text(&photo["license"])
            .and_then(|code| license_name(&code))
            .map(str::to_string),
        width: best(photo, "width", as_u32),
        height: best(photo, "height", as_u32),
        query: query.to_string(),
        provider: "flickr".to_string(),
    })
}

/// Parses a `flickr.photos.search` JSON payload.
pub fn parse_search_page(json: &Value, query: &str) -> Result<Page, ProviderError> {
    if json["stat"] != "ok" {
        let message = as_text(&json["message"]).unwrap_or_else(|| json["stat"].to_string());
        return Err(ProviderError::Api(message));
    }

    let photos = json["photos"]["photo"].as_array().map(Vec::as_slice).unwrap_or_default();
    Ok(Page {
        entries: photos.iter().filter_map(|p| map_photo(p, query)).collect(),
        raw_count: photos.len(),
        total_pages: as_u32(&json["photos"]["pages"]).map(|p| p as usize),
    })
}

// ============================================================================
// Client
// ============================================================================

pub struct FlickrProvider {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    throttle: Throttle,
}

impl FlickrProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: FLICKR_ENDPOINT.to_string(),
            throttle: Throttle::courtesy(),
        })
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    async fn fetch_page(&self, query: &str, page: usize, license: LicenseFilter) -> Result<Page, ProviderError> {
        let mut params: Vec<(&str, String)> = vec![
            ("method", "flickr.photos.search".into()),
            ("api_key", self.api_key.clone()),
            ("text", query.into()),
            ("content_type", "1".into()),
            ("media", "photos".into()),
            ("safe_search", "1".into()),
            ("per_page", PAGE_SIZE.to_string()),
            ("page", page.to_string()),
            ("extras", "owner_name,license,url_o,url_l,url_c,url_m".into()),
            ("format", "json".into()),
            ("nojsoncallback", "1".into()),
        ];
        if license == LicenseFilter::Open {
            params.push(("license", OPEN_LICENSES.into()));
        }

        let response = self.client.get(&self.endpoint).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let text = response.text().await?;
        let json: Value = serde_json::from_str(&text)?;
        parse_search_page(&json, query)
    }
}

#[async_trait]
impl ImageProvider for FlickrProvider {
    fn provider_id(&self) -> &str {
        "flickr"
    }

    #[instrument(skip(self))]
    async fn search(&self, query: &str, limit: usize, license: LicenseFilter) -> Vec<CandidateRecord> {
        let found = paginate(query, limit, self.throttle, move |page| {
            self.fetch_page(query, page, license)
        })
        .await;
        info!(query, found = found.len(), "Search finished");
        found
    }
}
