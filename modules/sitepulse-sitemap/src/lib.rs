//! Sitemap fetching and parsing. The fetcher retrieves XML (optionally
//! gzipped) with retry and conditional-request support; the parser streams
//! through it and yields either child sitemap URLs or URL entries.

use async_trait::async_trait;

use sitepulse_common::{DiscoveredUrl, Result, SitemapKind};

mod fetch;
mod parse;

pub use fetch::HttpFetcher;
pub use parse::parse_sitemap;

/// What a fetch produced. `NotModified` is returned for a 304 against the
/// stored ETag so the scanner can skip re-parsing.
#[derive(Debug, Clone)]
pub enum FetchResult {
    NotModified,
    Fetched { body: String, etag: Option<String> },
}

/// Parsed sitemap content, regardless of flavor.
#[derive(Debug, Clone, Default)]
pub struct ParsedSitemap {
    pub kind: Option<SitemapKind>,
    pub urls: Vec<DiscoveredUrl>,
    pub child_sitemaps: Vec<String>,
}

impl ParsedSitemap {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.child_sitemaps.is_empty()
    }
}

/// Seam between the scanner and the network. Production uses
/// [`HttpFetcher`]; tests substitute scripted bodies.
#[async_trait]
pub trait SitemapFetcher: Send + Sync {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchResult>;
}
