//! Single-attempt image download over HTTP.

use crate::traits::{FetchResponse, Fetcher};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub const USER_AGENT: &str = "image-harvester/0.1 dataset bootstrapper";
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTS: usize = 10;

/// Caps simultaneous connections per remote host, independent of the
/// download worker count.
pub struct HostLimiter {
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimiter {
    pub fn new(per_host: usize) -> Self {
        Self {
            per_host: per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for a connection slot on the URL's host. URLs without a host
    /// are not limited (they fail at request time anyway).
    pub async fn acquire(&self, url: &str) -> Option<OwnedSemaphorePermit> {
        let host = Url::parse(url).ok()?.host_str()?.to_ascii_lowercase();
        let semaphore = {
            let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(
                hosts
                    .entry(host)
                    .or_insert_with(|| Arc::new(Semaphore::new(self.per_host))),
            )
        };
        semaphore.acquire_owned().await.ok()
    }
}

pub struct HttpFetcher {
    client: reqwest::Client,
    hosts: HostLimiter,
}

impl HttpFetcher {
    /// Builds a client with the fixed user agent, a 30 s timeout and up to
    /// ten redirects.
    pub fn new(per_host: usize) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self::with_client(client, per_host))
    }

    pub fn with_client(client: reqwest::Client, per_host: usize) -> Self {
        Self {
            client,
            hosts: HostLimiter::new(per_host),
        }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> FetchResponse {
        let _permit = self.hosts.acquire(url).await;

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(url, "Fetch failed: {}", e);
                return FetchResponse::failed(-1);
            }
        };

        let status = response.status();
        if status != StatusCode::OK {
            return FetchResponse::failed(i32::from(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        match response.bytes().await {
            Ok(bytes) => FetchResponse::ok(bytes.to_vec(), content_type),
            Err(e) => {
                debug!(url, "Body read failed: {}", e);
                FetchResponse::failed(-1)
            }
        }
    }
}
