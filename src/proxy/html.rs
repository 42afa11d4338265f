//! HTML conversion: sanitising, text rendering and image tag rewriting.
//!
//! Regex-based; tolerant of malformed markup rather than exact.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use reqwest::Url;

static SCRIPT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>").unwrap());
static STYLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<style\b.*?</style\s*>").unwrap());
static HEAD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<head\b.*?</head\s*>").unwrap());
static COMMENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<!--.*?-->").unwrap());
static EMBEDDED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(iframe|frame|object|embed|form|noscript|svg)\b.*?</(iframe|frame|object|embed|form|noscript|svg)\s*>")
        .unwrap()
});
static VOID_UNSAFE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</?(meta|link|base|input|button|select|textarea|span|frameset|embed)\b[^>]*>")
        .unwrap()
});
static EVENT_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s(on[a-z]+|style|class)\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).unwrap()
});
static JS_HREF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\shref\s*=\s*["']\s*javascript:[^"']*["']"#).unwrap());

static TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title\s*>").unwrap());
static ANCHOR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*["']([^"']*)["'][^>]*>(.*?)</a\s*>"#).unwrap()
});
static BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<br\s*/?>").unwrap());
static BLOCK_END: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)</(p|div|h[1-6]|ul|ol|li|tr|table|blockquote|pre|section|article|header|footer)\s*>")
        .unwrap()
});
static LIST_ITEM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<li\b[^>]*>").unwrap());
static HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<h([1-6])\b[^>]*>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z]+);").unwrap());
static BLANK_LINES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").unwrap());

static URL_ATTR_DQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\b(href|src)\s*=\s*"([^"]*)""#).unwrap());
static URL_ATTR_SQ: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(href|src)\s*=\s*'([^']*)'").unwrap());

static IMG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<img\b[^>]*>").unwrap());
static IMG_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(src|width|height|alt)\s*=\s*("([^"]*)"|'([^']*)'|([^\s>]+))"#).unwrap()
});

/// Strip all tags and normalise whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove active content and presentational noise, keeping structure.
pub fn bleach(html: &str) -> String {
    let out = SCRIPT.replace_all(html, "");
    let out = STYLE.replace_all(&out, "");
    let out = COMMENT.replace_all(&out, "");
    let out = EMBEDDED.replace_all(&out, "");
    let out = VOID_UNSAFE.replace_all(&out, "");
    let out = JS_HREF.replace_all(&out, "");
    EVENT_ATTR.replace_all(&out, "").into_owned()
}

/// Contents of the `<title>` element, if non-empty.
pub fn title(html: &str) -> Option<String> {
    let caps = TITLE.captures(html)?;
    let text = decode_entities(&strip_html(&caps[1]));
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Render HTML as readable plain text. With `keep_links`, anchors become
/// `[text](url)`.
pub fn html_to_text(html: &str, keep_links: bool) -> String {
    let out = HEAD.replace_all(html, "");
    let out = SCRIPT.replace_all(&out, "");
    let out = STYLE.replace_all(&out, "");
    let out = COMMENT.replace_all(&out, "");
    let out = ANCHOR.replace_all(&out, |c: &Captures<'_>| {
        let text = strip_html(&c[2]);
        let href = &c[1];
        if !keep_links || href.is_empty() || href.starts_with('#') {
            text
        } else if text.is_empty() {
            format!("<{href}>")
        } else {
            format!("[{text}]({href})")
        }
    });
    let out = BREAK.replace_all(&out, "\n");
    let out = HEADING.replace_all(&out, |c: &Captures<'_>| {
        let level = c[1].parse::<usize>().unwrap_or(1);
        format!("\n\n{} ", "#".repeat(level))
    });
    let out = LIST_ITEM.replace_all(&out, "\n- ");
    let out = BLOCK_END.replace_all(&out, "\n\n");
    let out = TAG.replace_all(&out, "");
    let out = decode_entities(&out);

    let lines: Vec<String> = out
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    BLANK_LINES
        .replace_all(&lines.join("\n"), "\n\n")
        .trim()
        .to_string()
}

/// Decode the common named entities and numeric character references.
pub fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |c: &Captures<'_>| {
            let name = &c[1];
            let decoded = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse().ok().and_then(char::from_u32)
            } else {
                match name {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            decoded.map_or_else(|| c[0].to_string(), String::from)
        })
        .into_owned()
}

/// Resolve relative `href`/`src` attributes against `base`.
pub fn make_links_absolute(html: &str, base: &Url) -> String {
    let resolve = |c: &Captures<'_>, quote: char| {
        let attr = &c[1];
        let value = &c[2];
        let keep = value.is_empty()
            || value.starts_with('#')
            || value.contains("://")
            || ["data:", "mailto:", "javascript:", "tel:"]
                .iter()
                .any(|scheme| value.to_ascii_lowercase().starts_with(scheme));
        if keep {
            return c[0].to_string();
        }
        match base.join(value) {
            Ok(url) => format!("{attr}={quote}{url}{quote}"),
            Err(_) => c[0].to_string(),
        }
    };
    let out = URL_ATTR_DQ.replace_all(html, |c: &Captures<'_>| resolve(c, '"'));
    URL_ATTR_SQ
        .replace_all(&out, |c: &Captures<'_>| resolve(c, '\''))
        .into_owned()
}

// ── Images ──────────────────────────────────────────────────────────

/// An `<img>` tag's relevant attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageTag {
    pub src: Option<String>,
    pub width: Option<String>,
    pub height: Option<String>,
    pub alt: Option<String>,
}

impl ImageTag {
    fn parse(tag: &str) -> Self {
        let mut img = Self {
            src: None,
            width: None,
            height: None,
            alt: None,
        };
        for c in IMG_ATTR.captures_iter(tag) {
            let value = c
                .get(3)
                .or_else(|| c.get(4))
                .or_else(|| c.get(5))
                .map(|m| m.as_str().to_string());
            match c[1].to_ascii_lowercase().as_str() {
                "src" => img.src = value,
                "width" => img.width = value,
                "height" => img.height = value,
                "alt" => img.alt = value,
                _ => {}
            }
        }
        img
    }

    /// Images without size information, or at least 100×100, are worth
    /// inlining; smaller ones are usually trackers or icons.
    pub fn worth_inlining(&self) -> bool {
        let Some(src) = &self.src else {
            return false;
        };
        if src.is_empty() {
            return false;
        }
        let width = parse_dimension(self.width.as_deref().unwrap_or("0"));
        let height = parse_dimension(self.height.as_deref().unwrap_or("0"));
        let area = width.saturating_mul(height);
        area < 1 || area >= 100 * 100
    }
}

fn parse_dimension(value: &str) -> u64 {
    if value.is_empty() || value.contains('%') || value.contains("auto") {
        return 100;
    }
    let digits = match value.find("px").or_else(|| value.find('.')) {
        Some(end) => &value[..end],
        None => value,
    };
    digits.trim().parse().unwrap_or(100)
}

/// All image tags in document order.
pub fn image_tags(html: &str) -> Vec<ImageTag> {
    IMG.find_iter(html)
        .map(|m| ImageTag::parse(m.as_str()))
        .collect()
}

/// Rewrite every `<img>`: `Some(data_uri)` replaces the source and
/// stretches the image to full width, `None` drops the tag.
pub fn rewrite_images<F>(html: &str, mut replace: F) -> String
where
    F: FnMut(&ImageTag) -> Option<String>,
{
    IMG.replace_all(html, |c: &Captures<'_>| {
        let img = ImageTag::parse(&c[0]);
        match replace(&img) {
            Some(src) => {
                let alt = img.alt.as_deref().unwrap_or_default().replace('"', "&quot;");
                format!(r#"<img src="{src}" width="100%" height="auto" alt="{alt}">"#)
            }
            None => String::new(),
        }
    })
    .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(strip_html("<div><b>Bold</b> and <i>italic</i></div>"), "Bold and italic");
        assert_eq!(strip_html("<p>  Hello   World  </p>"), "Hello World");
        assert_eq!(strip_html(""), "");
    }

    #[test]
    fn title_extracted_and_decoded() {
        let html = "<html><head><title> Fish &amp; Chips </title></head><body></body></html>";
        assert_eq!(title(html).as_deref(), Some("Fish & Chips"));
        assert_eq!(title("<title>   </title>"), None);
        assert_eq!(title("<p>no title</p>"), None);
    }

    #[test]
    fn bleach_removes_active_content() {
        let html = r#"<div class="x" onclick="evil()"><script>alert(1)</script><span>kept</span><a href="javascript:void(0)">j</a><iframe src="x"></iframe><p style="color:red">text</p></div>"#;
        let clean = bleach(html);
        assert!(!clean.contains("script"));
        assert!(!clean.contains("onclick"));
        assert!(!clean.contains("iframe"));
        assert!(!clean.contains("style="));
        assert!(!clean.contains("<span"));
        assert!(!clean.contains("javascript:"));
        assert!(clean.contains("kept"));
        assert!(clean.contains("<p>text</p>"));
    }

    #[test]
    fn text_with_and_without_links() {
        let html = r#"<h1>News</h1><p>Read <a href="https://example.com/a">this</a> now.</p><ul><li>one</li><li>two</li></ul>"#;
        let with = html_to_text(html, true);
        assert!(with.contains("# News"));
        assert!(with.contains("Read [this](https://example.com/a) now."));
        assert!(with.contains("- one"));
        let without = html_to_text(html, false);
        assert!(without.contains("Read this now."));
        assert!(!without.contains("https://"));
    }

    #[test]
    fn text_drops_head_and_scripts() {
        let html = "<html><head><title>T</title></head><body><script>x()</script><p>a&nbsp;b &lt;c&gt;</p></body></html>";
        assert_eq!(html_to_text(html, true), "a b <c>");
    }

    #[test]
    fn links_made_absolute() {
        let base = Url::parse("https://example.com/news/article.html").unwrap();
        let html = r##"<a href="/about">a</a><img src='pic.png'><a href="https://other.test/">o</a><a href="#top">t</a>"##;
        let out = make_links_absolute(html, &base);
        assert!(out.contains(r#"href="https://example.com/about""#));
        assert!(out.contains("src='https://example.com/news/pic.png'"));
        assert!(out.contains(r#"href="https://other.test/""#));
        assert!(out.contains(r##"href="#top""##));
    }

    #[test]
    fn image_size_rules() {
        let tags = image_tags(
            r#"<img src="a.png"><img src="b.png" width="1" height="1"><img src="c.png" width="200px" height="150"><img width="500" height="500"><img src="d.png" width="50%" height="auto">"#,
        );
        let worth: Vec<bool> = tags.iter().map(ImageTag::worth_inlining).collect();
        assert_eq!(worth, vec![true, false, true, false, true]);
    }

    #[test]
    fn rewrite_inlines_or_drops() {
        let html = r#"<p><img src="big.png" alt="Big"><img src="pixel.gif" width="1" height="1"></p>"#;
        let out = rewrite_images(html, |img| {
            img.worth_inlining()
                .then(|| "data:image/png;base64,AAAA".to_string())
        });
        assert_eq!(
            out,
            r#"<p><img src="data:image/png;base64,AAAA" width="100%" height="auto" alt="Big"></p>"#
        );
    }

    #[test]
    fn numeric_entities() {
        assert_eq!(decode_entities("&#65;&#x42;&unknown;"), "AB&unknown;");
    }
}
