//! HTTP fetching for the content proxy.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use tracing::debug;

use super::cache::FetchedContent;
use crate::error::ProxyError;

/// Fetches a URL with a timeout and a size limit.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        max_size: usize,
    ) -> Result<FetchedContent, ProxyError>;
}

/// reqwest-backed fetcher. Asks intermediaries not to transform content.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<Self, ProxyError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-transform"));
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .map_err(|e| ProxyError::Fetch {
                url: String::new(),
                reason: format!("HTTP client setup failed: {e}"),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        timeout: Duration,
        max_size: usize,
    ) -> Result<FetchedContent, ProxyError> {
        let fetch_err = |e: reqwest::Error| ProxyError::Fetch {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let mut resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)?;

        let too_large = || ProxyError::TooLarge {
            url: url.to_string(),
            limit: max_size,
        };
        if resp.content_length().is_some_and(|len| len > max_size as u64) {
            return Err(too_large());
        }

        let header_text = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_type =
            header_text(header::CONTENT_TYPE).unwrap_or_else(|| "application/octet-stream".into());
        let content_disposition = header_text(header::CONTENT_DISPOSITION);
        let final_url = resp.url().to_string();

        let mut body = Vec::new();
        while let Some(chunk) = resp.chunk().await.map_err(fetch_err)? {
            if body.len() + chunk.len() > max_size {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url, final_url = %final_url, bytes = body.len(), "fetched");
        Ok(FetchedContent {
            url: final_url,
            content_type,
            content_disposition,
            body,
        })
    }
}
