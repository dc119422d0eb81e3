//! Single-page HTML collector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use scraper::Html;
use tracing::{info, instrument, warn};
use url::Url;

use intelhub_shared::{RawDocument, Result};

use crate::Collector;
use crate::extract::{html_to_text, main_content_html, page_title};
use crate::http::{build_client, fetch_bytes, parse_urls};

/// Fetches each configured page and produces one document from its main content.
pub struct PageCollector {
    name: String,
    urls: Vec<Url>,
    client: Client,
    allow_localhost: bool,
}

impl PageCollector {
    /// Create a page collector for the given page URLs.
    pub fn new(name: impl Into<String>, urls: &[String], timeout: Duration) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            urls: parse_urls(urls)?,
            client: build_client(timeout)?,
            allow_localhost: false,
        })
    }

    /// Allow fetching from localhost/private IPs (for mock servers).
    #[cfg(test)]
    pub fn allow_localhost(mut self) -> Self {
        self.allow_localhost = true;
        self
    }

    async fn fetch_page(&self, url: &Url) -> Result<Option<RawDocument>> {
        let bytes = fetch_bytes(&self.client, url, self.allow_localhost).await?;
        let html = String::from_utf8_lossy(&bytes);

        // Html is !Send; finish with it before the next await
        let (title, content_html) = {
            let doc = Html::parse_document(&html);
            (page_title(&doc), main_content_html(&doc))
        };

        let body = html_to_text(&content_html)?;
        if body.is_empty() {
            return Ok(None);
        }
        Ok(Some(RawDocument::new(
            self.name.clone(),
            url.as_str(),
            title,
            body,
            Utc::now(),
        )))
    }
}

#[async_trait]
impl Collector for PageCollector {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(collector = %self.name))]
    async fn produce(&self) -> Result<Vec<RawDocument>> {
        let mut docs = Vec::new();
        let mut last_err = None;

        for url in &self.urls {
            match self.fetch_page(url).await {
                Ok(Some(doc)) => docs.push(doc),
                Ok(None) => info!(%url, "page has no extractable content"),
                Err(e) => {
                    warn!(%url, error = %e, "page fetch failed");
                    last_err = Some(e);
                }
            }
        }

        match last_err {
            Some(e) if docs.is_empty() => Err(e),
            _ => Ok(docs),
        }
    }
}
