//! Language-aware reply templates.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::mailbox::MessageEnvelope;
use crate::outbound::OutboundMessage;

const DEFAULT_LANGUAGE: &str = "en";

/// Text keyed by language code. A plain string in YAML is English.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "TextRepr")]
pub struct LocalizedText(BTreeMap<String, String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum TextRepr {
    Single(String),
    ByLanguage(BTreeMap<String, String>),
}

impl From<TextRepr> for LocalizedText {
    fn from(repr: TextRepr) -> Self {
        match repr {
            TextRepr::Single(text) => Self::english(text),
            TextRepr::ByLanguage(map) => Self(
                map.into_iter()
                    .map(|(lang, text)| (lang.to_lowercase(), text))
                    .collect(),
            ),
        }
    }
}

impl LocalizedText {
    pub fn english(text: impl Into<String>) -> Self {
        Self(BTreeMap::from([(DEFAULT_LANGUAGE.to_string(), text.into())]))
    }

    pub fn with(mut self, lang: &str, text: impl Into<String>) -> Self {
        self.0.insert(lang.to_lowercase(), text.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Language whose key occurs in `content_language`, else `en`.
    pub fn detect(&self, content_language: Option<&str>) -> &str {
        let header = content_language.unwrap_or_default().to_lowercase();
        self.0
            .keys()
            .find(|lang| !header.is_empty() && header.contains(lang.as_str()))
            .map(String::as_str)
            .unwrap_or(DEFAULT_LANGUAGE)
    }

    /// Template for the detected language, falling back to `en`, then to
    /// any entry.
    pub fn pick(&self, content_language: Option<&str>) -> &str {
        let lang = self.detect(content_language);
        self.0
            .get(lang)
            .or_else(|| self.0.get(DEFAULT_LANGUAGE))
            .or_else(|| self.0.values().next())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Pick and fill in `{sender}`.
    pub fn render(&self, content_language: Option<&str>, sender: &str) -> String {
        self.pick(content_language).replace("{sender}", sender)
    }
}

/// `Re: <subject>` reply to the envelope's reply address.
pub fn build_reply(
    env: &MessageEnvelope,
    from: &str,
    body: String,
    message_id_domain: &str,
) -> Option<OutboundMessage> {
    let to = env.reply_address()?.display();
    Some(
        OutboundMessage::new(from, to, prefixed("Re:", &env.subject), body)
            .in_reply_to(env.message_id.clone())
            .message_id_domain(message_id_domain),
    )
}

/// Prefix a subject unless it already carries the prefix.
pub fn prefixed(prefix: &str, subject: &str) -> String {
    if subject
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    {
        subject.to_string()
    } else {
        format!("{prefix} {subject}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::envelope;

    fn texts() -> LocalizedText {
        LocalizedText::english("Hello {sender}").with("de", "Hallo {sender}")
    }

    #[test]
    fn detects_language_by_substring() {
        let t = texts();
        assert_eq!(t.detect(Some("de-DE")), "de");
        assert_eq!(t.detect(Some("fr")), "en");
        assert_eq!(t.detect(None), "en");
    }

    #[test]
    fn render_substitutes_sender() {
        assert_eq!(texts().render(Some("de"), "a@b.test"), "Hallo a@b.test");
        assert_eq!(texts().render(None, "a@b.test"), "Hello a@b.test");
    }

    #[test]
    fn falls_back_to_first_entry_without_english() {
        let t: LocalizedText = serde_yaml::from_str("de: Nur Deutsch").unwrap();
        assert_eq!(t.pick(Some("fr")), "Nur Deutsch");
    }

    #[test]
    fn plain_string_is_english() {
        let t: LocalizedText = serde_yaml::from_str("\"Just text\"").unwrap();
        assert_eq!(t.pick(Some("de")), "Just text");
    }

    #[test]
    fn reply_goes_to_reply_address() {
        let mut env = envelope(1, "a@spam.test", "me@private.test", "Offer");
        env.message_id = Some("<m1@spam.test>".into());
        let reply = build_reply(&env, "devnull@example.test", "No".into(), "noteventrashcan").unwrap();
        assert_eq!(reply.to, "a@spam.test");
        assert_eq!(reply.subject, "Re: Offer");
        assert_eq!(reply.in_reply_to.as_deref(), Some("<m1@spam.test>"));
        assert_eq!(reply.message_id_domain.as_deref(), Some("noteventrashcan"));
    }

    #[test]
    fn prefix_not_doubled() {
        assert_eq!(prefixed("Re:", "RE: hi"), "RE: hi");
        assert_eq!(prefixed("Fwd:", "hi"), "Fwd: hi");
    }
}
