//! RSS/Atom feed collector.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};
use url::Url;

use intelhub_shared::{IntelHubError, RawDocument, Result};

use crate::Collector;
use crate::extract::html_to_text;
use crate::http::{build_client, fetch_bytes, parse_urls};

/// Entries kept per feed per poll, newest first.
const MAX_ITEMS_PER_FEED: usize = 50;

/// Produces one document per feed entry. The entry's content (or summary)
/// becomes the body; entries with neither are skipped.
pub struct FeedCollector {
    name: String,
    urls: Vec<Url>,
    client: Client,
    allow_localhost: bool,
}

impl FeedCollector {
    /// Create a feed collector for the given feed URLs.
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

    async fn fetch_feed(&self, url: &Url) -> Result<Vec<RawDocument>> {
        let bytes = fetch_bytes(&self.client, url, self.allow_localhost).await?;
        let feed = feed_rs::parser::parse(&bytes[..])
            .map_err(|e| IntelHubError::Conversion(format!("{url}: feed parse failed: {e}")))?;

        let mut entries = feed.entries;
        entries.sort_by(|a, b| {
            let a = a.published.or(a.updated);
            let b = b.published.or(b.updated);
            b.cmp(&a)
        });
        entries.truncate(MAX_ITEMS_PER_FEED);

        let now = Utc::now();
        let mut docs = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(link) = entry
                .links
                .first()
                .map(|l| l.href.clone())
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))
            else {
                debug!(id = %entry.id, "feed entry has no link, skipping");
                continue;
            };

            let html = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .unwrap_or_default();
            let body = html_to_text(&html)?;
            if body.is_empty() {
                debug!(%link, "feed entry has no body, skipping");
                continue;
            }

            docs.push(RawDocument::new(
                self.name.clone(),
                link,
                entry.title.map(|t| t.content.trim().to_string()),
                body,
                entry.published.or(entry.updated).unwrap_or(now),
            ));
        }
        Ok(docs)
    }
}

#[async_trait]
impl Collector for FeedCollector {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(collector = %self.name))]
    async fn produce(&self) -> Result<Vec<RawDocument>> {
        let mut docs = Vec::new();
        let mut last_err = None;

        for url in &self.urls {
            match self.fetch_feed(url).await {
                Ok(mut batch) => {
                    info!(%url, entries = batch.len(), "feed parsed");
                    docs.append(&mut batch);
                }
                Err(e) => {
                    warn!(%url, error = %e, "feed fetch failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel>
  <title>Wire</title>
  <link>https://news.example.com/</link>
  <description>Test wire</description>
  <item>
    <title>Flooding closes river crossings</title>
    <link>https://news.example.com/flooding</link>
    <description>&lt;p&gt;Three bridges were closed on &lt;b&gt;Tuesday&lt;/b&gt;.&lt;/p&gt;</description>
    <pubDate>Tue, 10 Jun 2025 08:00:00 GMT</pubDate>
  </item>
  <item>
    <title>Empty entry</title>
    <link>https://news.example.com/empty</link>
  </item>
</channel></rss>"#;

    #[tokio::test]
    async fn produces_documents_from_rss() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;

        let url = format!("{}/feed.xml", server.uri());
        let collector = FeedCollector::new("wire", &[url], Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let docs = collector.produce().await.unwrap();

        assert_eq!(docs.len(), 1);
        let doc = &docs[0];
        assert_eq!(doc.source_name, "wire");
        assert_eq!(doc.source_url, "https://news.example.com/flooding");
        assert_eq!(doc.title.as_deref(), Some("Flooding closes river crossings"));
        assert!(doc.body.contains("Three bridges"));
        assert!(!doc.body.contains("<p>"));
        assert_eq!(doc.crawled_at.to_rfc3339(), "2025-06-10T08:00:00+00:00");
    }

    #[tokio::test]
    async fn all_feeds_failing_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let url = format!("{}/feed.xml", server.uri());
        let collector = FeedCollector::new("wire", &[url], Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        let err = collector.produce().await.unwrap_err();
        assert!(err.to_string().contains("503"));
    }

    #[tokio::test]
    async fn one_broken_feed_does_not_hide_the_others() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string(RSS))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad.xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not a feed"))
            .mount(&server)
            .await;

        let urls = vec![
            format!("{}/bad.xml", server.uri()),
            format!("{}/good.xml", server.uri()),
        ];
        let collector = FeedCollector::new("wire", &urls, Duration::from_secs(5))
            .unwrap()
            .allow_localhost();
        assert_eq!(collector.produce().await.unwrap().len(), 1);
    }
}
