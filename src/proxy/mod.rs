//! Content proxy: turns a mail full of links into mail full of content.
//!
//! For a proxy request the pipeline is:
//! 1. Options from the recipient address ([`options`])
//! 2. URLs from the body and subject ([`urls`])
//! 3. Each URL through the disk cache or the network ([`cache`], [`fetch`])
//! 4. HTML transforms: bleach, inline images, text conversion ([`html`])
//! 5. One outbound message per URL, to the sender or the Kindle address

pub mod cache;
pub mod fetch;
pub mod html;
pub mod options;
pub mod urls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::future::join_all;
use reqwest::Url;
use tracing::{debug, info, warn};

use crate::error::ProxyError;
use crate::handlers::PROXY_DOMAIN;
use crate::mailbox::MessageEnvelope;
use crate::outbound::{Attachment, OutboundMessage};

pub use cache::{FetchedContent, UrlCache};
pub use fetch::{HttpFetcher, PageFetcher};
pub use options::ProxyOptions;

/// Addresses and limits for the proxy.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub send_from: String,
    pub kindle_send_from: Option<String>,
    pub kindle_send_to: Option<String>,
    pub fetch_timeout: Duration,
    pub max_download_size: usize,
    pub image_timeout: Duration,
    pub max_images: usize,
}

impl ProxySettings {
    pub fn new(send_from: impl Into<String>) -> Self {
        Self {
            send_from: send_from.into(),
            kindle_send_from: None,
            kindle_send_to: None,
            fetch_timeout: Duration::from_secs(30),
            max_download_size: 100 * 1024 * 1024,
            image_timeout: Duration::from_secs(10),
            max_images: 100,
        }
    }
}

/// Result of the HTML transform step.
struct Transformed {
    content: String,
    title: Option<String>,
    subtype: &'static str,
    prefix: String,
}

pub struct ContentProxy {
    settings: ProxySettings,
    cache: UrlCache,
    fetcher: Arc<dyn PageFetcher>,
}

impl ContentProxy {
    pub fn new(settings: ProxySettings, cache: UrlCache, fetcher: Arc<dyn PageFetcher>) -> Self {
        Self {
            settings,
            cache,
            fetcher,
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Serve `url` from the cache, fetching and storing it on a miss.
    pub async fn get_or_fetch(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<FetchedContent, ProxyError> {
        match self.cache.get(url).await {
            Ok(Some(hit)) => return Ok(hit),
            Ok(None) => {}
            Err(e) => warn!(url, "cache read failed: {e}"),
        }
        let fetched = self
            .fetcher
            .fetch(url, timeout, self.settings.max_download_size)
            .await?;
        if let Err(e) = self.cache.put(url, &fetched).await {
            warn!(url, "cache write failed: {e}");
        }
        Ok(fetched)
    }

    /// `(from, to)` for proxy output.
    pub fn route(&self, options: &ProxyOptions, env: &MessageEnvelope) -> Option<(String, String)> {
        if options.kindle {
            if let Some(to) = &self.settings.kindle_send_to {
                let from = self
                    .settings
                    .kindle_send_from
                    .clone()
                    .unwrap_or_else(|| self.settings.send_from.clone());
                return Some((from, to.clone()));
            }
            warn!(uid = %env.id, "kindle requested but no kindle address configured");
        }
        let to = env.reply_address()?.display();
        Some((self.settings.send_from.clone(), to))
    }

    /// Build the outgoing messages for one proxy request. URLs that fail to
    /// fetch are logged and skipped.
    pub async fn process(&self, env: &MessageEnvelope, raw: &[u8]) -> Vec<OutboundMessage> {
        let options = ProxyOptions::from_recipients(&env.to);
        let urls = urls::extract_from_message(raw, &env.subject);
        let Some(route) = self.route(&options, env) else {
            warn!(uid = %env.id, "proxy request without a sender; nothing to reply to");
            return Vec::new();
        };
        info!(
            uid = %env.id,
            urls = urls.len(),
            options = ?options.enabled(),
            to = %route.1,
            "proxying"
        );

        let results = join_all(
            urls.iter()
                .map(|url| self.build_message(url, env, &options, &route)),
        )
        .await;

        urls.iter()
            .zip(results)
            .filter_map(|(url, result)| match result {
                Ok(msg) => Some(msg),
                Err(e) => {
                    warn!(uid = %env.id, url = %url, "proxy fetch failed: {e}");
                    None
                }
            })
            .collect()
    }

    async fn build_message(
        &self,
        url: &str,
        env: &MessageEnvelope,
        options: &ProxyOptions,
        (from, to): &(String, String),
    ) -> Result<OutboundMessage, ProxyError> {
        let fetched = self.get_or_fetch(url, self.settings.fetch_timeout).await?;
        let mime = fetched.mime();
        let (maintype, subtype) = mime.split_once('/').unwrap_or((mime.as_str(), ""));

        let mut filename = filename_for(&fetched);
        let mut title = env.subject.clone();
        let mut prefix = String::new();
        let mut text: Option<(String, String)> = None;

        if maintype == "text" {
            let decoded = decode_text(&fetched.body, fetched.charset().as_deref());
            if subtype.contains("html") {
                let html = match Url::parse(&fetched.url) {
                    Ok(base) => html::make_links_absolute(&decoded, &base),
                    Err(_) => decoded,
                };
                let t = self.transform_html(html, options).await;
                if let Some(page_title) = t.title {
                    title = page_title;
                }
                filename = fix_extension(filename, t.subtype);
                prefix = t.prefix;
                text = Some((t.content, t.subtype.to_string()));
            } else {
                let out_subtype = if subtype.contains("plain") { "plain" } else { subtype };
                filename = fix_extension(filename, out_subtype);
                text = Some((decoded, out_subtype.to_string()));
            }
        }

        let subject = if prefix.is_empty() {
            title
        } else {
            format!("[{prefix}]: {title}")
        };
        let mut full_filename = format!("{}: {filename}", env.subject);
        let info = format!("URL: {}\nContent-Type: {}", fetched.url, fetched.content_type);

        let msg = OutboundMessage::new(from, to, subject, info.clone())
            .in_reply_to(env.message_id.clone())
            .message_id_domain(PROXY_DOMAIN);

        let msg = match text {
            Some((content, sub)) if options.inline && sub == "html" => OutboundMessage {
                body: content,
                ..msg
            }
            .body_content_type("text/html; charset=utf-8"),
            Some((content, _)) if options.inline => OutboundMessage {
                body: format!("{info}\n\n{content}"),
                ..msg
            },
            Some((content, sub)) => msg.attach(Attachment {
                filename: full_filename,
                content_type: format!("text/{sub}; charset=utf-8"),
                data: content.into_bytes(),
            }),
            None => {
                if maintype == "application" && subtype.contains("pdf") && !filename.ends_with(".pdf") {
                    full_filename.push_str(".pdf");
                }
                msg.attach(Attachment {
                    filename: full_filename,
                    content_type: mime.clone(),
                    data: fetched.body,
                })
            }
        };
        Ok(msg)
    }

    async fn transform_html(&self, html: String, options: &ProxyOptions) -> Transformed {
        let title = html::title(&html);
        let mut html = html;
        let mut prefix = String::new();

        if options.bleach {
            prefix.insert(0, 'B');
            html = html::bleach(&html);
        }
        if options.images {
            prefix.insert(0, 'I');
            html = self.inline_images(&html).await;
        }

        if options.txt {
            prefix.insert_str(0, if options.wolinks { "TP" } else { "TL" });
            Transformed {
                content: html::html_to_text(&html, !options.wolinks),
                title,
                subtype: "plain",
                prefix,
            }
        } else {
            Transformed {
                content: html,
                title,
                subtype: "html",
                prefix,
            }
        }
    }

    /// Replace worthwhile `<img>` sources with data URIs; drop the rest.
    async fn inline_images(&self, html: &str) -> String {
        let mut sources: Vec<String> = Vec::new();
        for img in html::image_tags(html) {
            if let (true, Some(src)) = (img.worth_inlining(), img.src)
                && !src.starts_with("data:")
                && !sources.contains(&src)
            {
                sources.push(src);
            }
        }
        sources.truncate(self.settings.max_images);

        let fetched = join_all(sources.iter().map(|src| self.image_data_uri(src))).await;
        let inlined: HashMap<&str, String> = sources
            .iter()
            .zip(fetched)
            .filter_map(|(src, result)| match result {
                Ok(uri) => Some((src.as_str(), uri)),
                Err(e) => {
                    debug!(src = %src, "image skipped: {e}");
                    None
                }
            })
            .collect();

        html::rewrite_images(html, |img| {
            let src = img.src.as_deref()?;
            if src.starts_with("data:") {
                return Some(src.to_string());
            }
            inlined.get(src).cloned()
        })
    }

    async fn image_data_uri(&self, src: &str) -> Result<String, ProxyError> {
        let image = self.get_or_fetch(src, self.settings.image_timeout).await?;
        Ok(format!(
            "data:{};base64,{}",
            image.mime(),
            STANDARD.encode(&image.body)
        ))
    }
}

/// Filename from Content-Disposition, else derived from the URL.
pub fn filename_for(content: &FetchedContent) -> String {
    if let Some(cd) = &content.content_disposition
        && let Some(start) = cd.find("filename=")
    {
        let rest = &cd[start + "filename=".len()..];
        let name = rest.split(';').next().unwrap_or_default();
        let name = name.trim().trim_matches(['"', '\'']);
        if !name.is_empty() {
            return name.to_string();
        }
    }
    let name = content
        .url
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .replace(['/', '.'], " ");
    let name = name.trim();
    if name.is_empty() {
        "download".into()
    } else {
        name.to_string()
    }
}

/// Make sure the filename's extension matches the text subtype.
pub fn fix_extension(filename: String, subtype: &str) -> String {
    match subtype {
        "plain" if !filename.ends_with(".txt") => format!("{filename}.txt"),
        "html" if !filename.ends_with(".html") => format!("{filename}.html"),
        _ => filename,
    }
}

/// Decode with the declared charset, falling back to UTF-8, then Latin-1.
/// Newlines are normalised to `\n`.
pub fn decode_text(body: &[u8], charset: Option<&str>) -> String {
    let latin1 = |bytes: &[u8]| bytes.iter().map(|&b| b as char).collect::<String>();
    let text = match charset {
        Some("iso-8859-1" | "latin1" | "latin-1" | "iso8859-1") => latin1(body),
        _ => match std::str::from_utf8(body) {
            Ok(s) => s.to_string(),
            Err(_) => latin1(body),
        },
    };
    text.replace("\r\n", "\n").replace("\n\r", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StaticFetcher, envelope};

    const PAGE: &str = r#"<html><head><title>The Article</title><script>track()</script></head>
<body><p onclick="x()">Body <a href="/more">more</a></p><img src="/hero.jpg"><img src="/pixel.gif" width="1" height="1"></body></html>"#;

    fn proxy(fetcher: Arc<StaticFetcher>, dir: &std::path::Path) -> ContentProxy {
        let mut settings = ProxySettings::new("Proxy <proxy@example.test>");
        settings.kindle_send_from = Some("Kindle <kindle@example.test>".into());
        settings.kindle_send_to = Some("me@kindle.test".into());
        ContentProxy::new(settings, UrlCache::new(dir), fetcher)
    }

    fn fetcher() -> Arc<StaticFetcher> {
        let f = StaticFetcher::new();
        f.insert(FetchedContent::new(
            "https://x.test/article",
            "text/html; charset=utf-8",
            PAGE.as_bytes().to_vec(),
        ));
        f.insert(FetchedContent::new(
            "https://x.test/hero.jpg",
            "image/jpeg",
            vec![1, 2, 3],
        ));
        f.insert(FetchedContent::new(
            "https://x.test/paper.pdf",
            "application/pdf",
            b"%PDF-1.4".to_vec(),
        ));
        Arc::new(f)
    }

    fn request(to: &str, body: &str) -> (MessageEnvelope, Vec<u8>) {
        let mut env = envelope(9, "me@private.test", to, "Reading list");
        env.message_id = Some("<req@private.test>".into());
        let raw = format!(
            "From: me@private.test\r\nTo: {to}\r\nSubject: Reading list\r\n\
             Message-ID: <req@private.test>\r\n\r\n{body}\r\n"
        );
        (env, raw.into_bytes())
    }

    #[tokio::test]
    async fn html_as_attachment_back_to_sender() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(fetcher(), dir.path());
        let (env, raw) = request("proxy@x.test", "https://x.test/article");

        let out = p.process(&env, &raw).await;
        assert_eq!(out.len(), 1);
        let msg = &out[0];
        assert_eq!(msg.from, "Proxy <proxy@example.test>");
        assert_eq!(msg.to, "me@private.test");
        assert_eq!(msg.subject, "The Article");
        assert_eq!(msg.in_reply_to.as_deref(), Some("<req@private.test>"));
        assert_eq!(msg.message_id_domain.as_deref(), Some(PROXY_DOMAIN));
        let att = &msg.attachments[0];
        assert_eq!(att.filename, "Reading list: x test article.html");
        let html = String::from_utf8(att.data.clone()).unwrap();
        assert!(html.contains(r#"href="https://x.test/more""#));
    }

    #[tokio::test]
    async fn txt_bleach_kindle_converts_and_routes_to_device() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(fetcher(), dir.path());
        let (env, raw) = request("txt+bleach+kindle+proxy@x.test", "https://x.test/article");

        let out = p.process(&env, &raw).await;
        let msg = &out[0];
        assert_eq!(msg.from, "Kindle <kindle@example.test>");
        assert_eq!(msg.to, "me@kindle.test");
        assert_eq!(msg.subject, "[TLB]: The Article");
        let att = &msg.attachments[0];
        assert!(att.filename.ends_with(".txt"));
        let text = String::from_utf8(att.data.clone()).unwrap();
        assert!(text.contains("Body [more](https://x.test/more)"));
        assert!(!text.contains("track()"));
    }

    #[tokio::test]
    async fn cached_url_is_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let f = fetcher();
        let p = proxy(f.clone(), dir.path());
        let (env, raw) = request("txt+proxy@x.test", "https://x.test/article");

        assert_eq!(p.process(&env, &raw).await.len(), 1);
        assert_eq!(p.process(&env, &raw).await.len(), 1);
        assert_eq!(f.calls("https://x.test/article"), 1);
    }

    #[tokio::test]
    async fn images_inlined_and_trackers_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(fetcher(), dir.path());
        let (env, raw) = request("images+inline+proxy@x.test", "https://x.test/article");

        let out = p.process(&env, &raw).await;
        let msg = &out[0];
        assert_eq!(msg.subject, "[I]: The Article");
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.body_content_type.as_deref(), Some("text/html; charset=utf-8"));
        assert!(msg.body.contains("data:image/jpeg;base64,AQID"));
        assert!(!msg.body.contains("pixel.gif"));
    }

    #[tokio::test]
    async fn pdf_gets_extension() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(fetcher(), dir.path());
        let (env, raw) = request("proxy@x.test", "https://x.test/paper.pdf");

        let out = p.process(&env, &raw).await;
        let att = &out[0].attachments[0];
        assert_eq!(att.filename, "Reading list: x test paper pdf.pdf");
        assert_eq!(att.content_type, "application/pdf");
        assert_eq!(att.data, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn failed_urls_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let p = proxy(fetcher(), dir.path());
        let (env, raw) = request(
            "proxy@x.test",
            "https://x.test/article https://x.test/missing",
        );
        let out = p.process(&env, &raw).await;
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn filename_from_disposition() {
        let mut c = FetchedContent::new("https://x.test/dl", "application/zip", vec![]);
        c.content_disposition = Some("attachment; filename=\"report.zip\"; size=3".into());
        assert_eq!(filename_for(&c), "report.zip");
    }

    #[test]
    fn extension_fixing() {
        assert_eq!(fix_extension("doc".into(), "plain"), "doc.txt");
        assert_eq!(fix_extension("doc.txt".into(), "plain"), "doc.txt");
        assert_eq!(fix_extension("page".into(), "html"), "page.html");
        assert_eq!(fix_extension("file.pdf".into(), "pdf"), "file.pdf");
    }

    #[test]
    fn decoding_falls_back_to_latin1() {
        assert_eq!(decode_text("Héllo\r\nwörld".as_bytes(), Some("utf-8")), "Héllo\nwörld");
        assert_eq!(decode_text(&[0x48, 0xe9], Some("iso-8859-1")), "Hé");
        assert_eq!(decode_text(&[0x48, 0xe9], None), "Hé");
    }
}
