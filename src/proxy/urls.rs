//! URL extraction from proxy requests.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use mail_parser::MessageParser;
use regex::Regex;

use super::html::html_to_text;

static URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"{}|\\^`\[\]'()]+"#).unwrap());

/// Valid in URLs but usually prose punctuation when trailing.
const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '*'];

/// URLs found in free text, trailing punctuation removed.
pub fn extract_urls(text: &str) -> BTreeSet<String> {
    URL.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(TRAILING_PUNCTUATION).to_string())
        .filter(|u| !u.ends_with("://"))
        .collect()
}

/// URLs in every text and HTML body part of `raw`, plus the subject.
pub fn extract_from_message(raw: &[u8], subject: &str) -> BTreeSet<String> {
    let mut urls = extract_urls(subject);
    let Some(parsed) = MessageParser::default().parse(raw) else {
        return urls;
    };
    for text in (0..).map_while(|i| parsed.body_text(i)) {
        urls.extend(extract_urls(&text));
    }
    for html in (0..).map_while(|i| parsed.body_html(i)) {
        urls.extend(extract_urls(&html_to_text(&html, true)));
    }
    urls
}
