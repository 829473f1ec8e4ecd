use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;
use tracing::{debug, warn};

use sitepulse_common::{Result, SitepulseError};

use crate::{FetchResult, SitemapFetcher};

const USER_AGENT: &str = "SitemapIndexerPro/2.0";
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_DEADLINE)
            .gzip(true)
            .deflate(true)
            .build()
            .expect("Failed to build sitemap HTTP client");
        Self { client }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SitemapFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchResult> {
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            if attempt > 1 {
                // Exponential backoff: 1s, 2s between attempts.
                tokio::time::sleep(BACKOFF_BASE * 2u32.pow(attempt - 2)).await;
            }

            let mut request = self.client.get(url);
            if let Some(etag) = etag {
                request = request.header("If-None-Match", etag);
            }

            let response = match request.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = format!("request failed: {e}");
                    warn!(url, attempt, error = %e, "Sitemap fetch network error");
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 304 {
                debug!(url, "Sitemap not modified");
                return Ok(FetchResult::NotModified);
            }
            if status.is_server_error() {
                last_error = format!("server returned {status}");
                warn!(url, attempt, %status, "Sitemap fetch server error");
                continue;
            }
            if !status.is_success() {
                // 4xx is not retryable.
                return Err(SitepulseError::InvalidSitemap(format!(
                    "{url} returned {status}"
                )));
            }

            let response_etag = response
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            let bytes = match response.bytes().await {
                Ok(b) => b,
                Err(e) => {
                    last_error = format!("body read failed: {e}");
                    warn!(url, attempt, error = %e, "Sitemap body read error");
                    continue;
                }
            };

            let body = decode_body(url, &bytes)?;
            return Ok(FetchResult::Fetched {
                body,
                etag: response_etag,
            });
        }

        Err(SitepulseError::Transient(format!(
            "fetching {url} failed after {MAX_ATTEMPTS} attempts: {last_error}"
        )))
    }
}

/// Transport-level gzip is handled by the client; this covers `.gz`
/// objects that arrive with the gzip magic still in the body.
fn decode_body(url: &str, bytes: &[u8]) -> Result<String> {
    if bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b {
        let mut decoder = MultiGzDecoder::new(bytes);
        let mut out = String::new();
        decoder
            .read_to_string(&mut out)
            .map_err(|e| SitepulseError::InvalidSitemap(format!("{url}: gzip decode: {e}")))?;
        return Ok(out);
    }
    String::from_utf8(bytes.to_vec())
        .map_err(|e| SitepulseError::InvalidSitemap(format!("{url}: invalid utf-8: {e}")))
}
