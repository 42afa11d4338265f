//! Disk cache for fetched URLs, keyed by the SHA-256 of the URL.
//!
//! Each entry is two files: `<key>` with the raw body and `<key>.meta.json`
//! with the final URL and response headers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::ProxyError;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A fetched resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedContent {
    /// Final URL after redirects.
    pub url: String,
    pub content_type: String,
    #[serde(default)]
    pub content_disposition: Option<String>,
    #[serde(skip)]
    pub body: Vec<u8>,
}

impl FetchedContent {
    pub fn new(url: impl Into<String>, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            content_disposition: None,
            body,
        }
    }

    /// Lower-cased `type/subtype` without parameters.
    pub fn mime(&self) -> String {
        self.content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
    }

    /// The `charset` parameter of the content type, if any.
    pub fn charset(&self) -> Option<String> {
        self.content_type.split(';').skip(1).find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("charset")
                .then(|| value.trim().trim_matches('"').to_ascii_lowercase())
        })
    }
}

/// SHA-256 hex digest of the URL.
pub fn cache_key(url: &str) -> String {
    format!("{:x}", Sha256::digest(url.as_bytes()))
}

pub struct UrlCache {
    dir: PathBuf,
}

impl UrlCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, url: &str) -> (PathBuf, PathBuf) {
        let key = cache_key(url);
        (
            self.dir.join(&key),
            self.dir.join(format!("{key}.meta.json")),
        )
    }

    /// Cached content for `url`, if present.
    pub async fn get(&self, url: &str) -> Result<Option<FetchedContent>, ProxyError> {
        let (body_path, meta_path) = self.paths(url);
        let body = match tokio::fs::read(&body_path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut content = match tokio::fs::read(&meta_path).await {
            Ok(meta) => serde_json::from_slice::<FetchedContent>(&meta)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                FetchedContent::new(url, DEFAULT_CONTENT_TYPE, Vec::new())
            }
            Err(e) => return Err(e.into()),
        };
        content.body = body;
        debug!(url, path = %body_path.display(), "cache hit");
        Ok(Some(content))
    }

    /// Store content under `url`.
    pub async fn put(&self, url: &str, content: &FetchedContent) -> Result<(), ProxyError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ProxyError::Cache(format!("{}: {e}", self.dir.display())))?;
        let (body_path, meta_path) = self.paths(url);
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(content)?).await?;
        tokio::fs::write(&body_path, &content.body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sha256_hex() {
        assert_eq!(
            cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn key_is_lowercase_sha256_hex() {
        assert_eq!(
            cache_key("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn content_type_parts() {
        let c = FetchedContent::new("u", "Text/HTML; Charset=\"ISO-8859-1\"", vec![]);
        assert_eq!(c.mime(), "text/html");
        assert_eq!(c.charset().as_deref(), Some("iso-8859-1"));
        assert_eq!(FetchedContent::new("u", "image/png", vec![]).charset(), None);
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = UrlCache::new(dir.path().join("cache"));
        assert!(cache.get("https://x.test/a").await.unwrap().is_none());

        let mut content =
            FetchedContent::new("https://x.test/final", "text/html", b"<p>hi</p>".to_vec());
        content.content_disposition = Some("inline; filename=\"a.html\"".into());
        cache.put("https://x.test/a", &content).await.unwrap();

        let hit = cache.get("https://x.test/a").await.unwrap().unwrap();
        assert_eq!(hit, content);
        assert!(dir.path().join("cache").join(cache_key("https://x.test/a")).exists());
    }

    #[tokio::test]
    async fn body_without_metadata_is_still_a_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = UrlCache::new(dir.path());
        std::fs::write(dir.path().join(cache_key("https://x.test/b")), b"raw").unwrap();

        let hit = cache.get("https://x.test/b").await.unwrap().unwrap();
        assert_eq!(hit.body, b"raw");
        assert_eq!(hit.content_type, DEFAULT_CONTENT_TYPE);
    }
}
