//! Message envelope: the read-only view of a message that rules evaluate.

use chrono::{DateTime, Utc};
use mail_parser::{Address, HeaderValue, MessageParser, PartType};
use serde::{Deserialize, Serialize};

use super::MessageId;
use crate::proxy::html::strip_html;

/// A single mailbox address with optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

impl EmailAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            name: None,
            address: address.into(),
        }
    }

    /// `Name <addr>` when a display name is present, else the bare address.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{name} <{}>", self.address),
            _ => self.address.clone(),
        }
    }
}

/// Envelope fields of a fetched message. Never mutated after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: MessageId,
    pub from: Vec<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub reply_to: Vec<EmailAddress>,
    pub subject: String,
    /// Message-ID header, including angle brackets.
    pub message_id: Option<String>,
    pub content_language: Option<String>,
    pub received_at: DateTime<Utc>,
    /// Readable body text. `None` when only the header block was fetched.
    pub body: Option<String>,
}

impl MessageEnvelope {
    /// Parse raw message bytes (a header block or a full message).
    ///
    /// Returns `None` when the bytes are not a recognisable message.
    pub fn parse(id: MessageId, raw: &[u8], with_body: bool) -> Option<Self> {
        let parsed = MessageParser::default().parse(raw)?;
        if parsed.headers().is_empty() {
            return None;
        }

        let content_language = parsed
            .headers()
            .iter()
            .find(|h| h.name.as_str().eq_ignore_ascii_case("Content-Language"))
            .and_then(|h| header_text(&h.value));

        let received_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        let body = with_body.then(|| extract_text(&parsed));

        Some(Self {
            id,
            from: extract_addresses(parsed.from()),
            to: extract_addresses(parsed.to()),
            cc: extract_addresses(parsed.cc()),
            reply_to: extract_addresses(parsed.reply_to()),
            subject: parsed.subject().unwrap_or_default().to_string(),
            message_id: parsed.message_id().map(|m| format!("<{m}>")),
            content_language,
            received_at,
            body,
        })
    }

    /// Where replies go: Reply-To, else From.
    pub fn reply_address(&self) -> Option<&EmailAddress> {
        self.reply_to.first().or_else(|| self.from.first())
    }

    /// First From address, rendered for display.
    pub fn sender(&self) -> String {
        self.from
            .first()
            .map(EmailAddress::display)
            .unwrap_or_else(|| "unknown".into())
    }
}

fn header_text(value: &HeaderValue<'_>) -> Option<String> {
    if let Some(text) = value.as_text() {
        return Some(text.trim().to_string());
    }
    value
        .as_text_list()
        .map(|list| list.iter().map(|s| s.trim()).collect::<Vec<_>>().join(", "))
}

/// Extract addresses from an optional mail_parser Address field.
///
/// Returns an empty vec if the address is None.
pub fn extract_addresses(addr: Option<&Address<'_>>) -> Vec<EmailAddress> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    let convert = |a: &mail_parser::Addr<'_>| {
        a.address.as_ref().map(|address| EmailAddress {
            name: a.name.as_ref().map(|n| n.to_string()),
            address: address.to_string(),
        })
    };
    match addr {
        Address::List(addrs) => addrs.iter().filter_map(convert).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().filter_map(convert))
            .collect(),
    }
}

/// Readable text of every text part, HTML parts with tags stripped.
///
/// Body predicates search this, so it has to cover the alternatives a
/// server-side `BODY` search would see, not just the preferred one.
fn extract_text(parsed: &mail_parser::Message<'_>) -> String {
    parsed
        .parts
        .iter()
        .filter_map(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            PartType::Html(html) => Some(strip_html(html)),
            _ => None,
        })
        .filter(|text| !text.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "From: Alice Example <alice@news.test>\r\n\
        To: bob@private.test, Carol <carol@other.test>\r\n\
        Cc: dave@cc.test\r\n\
        Reply-To: replies@news.test\r\n\
        Subject: Weekly digest\r\n\
        Message-ID: <abc123@news.test>\r\n\
        Content-Language: de-DE\r\n\
        Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
        Content-Type: text/plain; charset=utf-8\r\n\
        \r\n\
        Hello there, see https://example.com/article\r\n";

    #[test]
    fn parses_header_fields() {
        let env = MessageEnvelope::parse(MessageId(7), RAW.as_bytes(), false).unwrap();
        assert_eq!(env.id, MessageId(7));
        assert_eq!(env.from[0].address, "alice@news.test");
        assert_eq!(env.from[0].name.as_deref(), Some("Alice Example"));
        assert_eq!(env.to.len(), 2);
        assert_eq!(env.cc[0].address, "dave@cc.test");
        assert_eq!(env.subject, "Weekly digest");
        assert_eq!(env.message_id.as_deref(), Some("<abc123@news.test>"));
        assert_eq!(env.content_language.as_deref(), Some("de-DE"));
        assert_eq!(env.received_at.timestamp(), 1_736_157_600);
        assert!(env.body.is_none());
    }

    #[test]
    fn body_loaded_on_request() {
        let env = MessageEnvelope::parse(MessageId(1), RAW.as_bytes(), true).unwrap();
        assert!(env.body.unwrap().contains("https://example.com/article"));
    }

    #[test]
    fn body_covers_every_alternative() {
        let raw = "From: x@news.test\r\n\
            To: y@private.test\r\n\
            Subject: Alternatives\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"b1\"\r\n\
            \r\n\
            --b1\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            hello\r\n\
            --b1\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>unsubscribe</p>\r\n\
            --b1--\r\n";
        let env = MessageEnvelope::parse(MessageId(3), raw.as_bytes(), true).unwrap();
        let body = env.body.unwrap();
        assert!(body.contains("hello"));
        assert!(body.contains("unsubscribe"));
        assert!(!body.contains("<p>"));
    }

    #[test]
    fn reply_address_prefers_reply_to() {
        let env = MessageEnvelope::parse(MessageId(1), RAW.as_bytes(), false).unwrap();
        assert_eq!(env.reply_address().unwrap().address, "replies@news.test");
    }

    #[test]
    fn reply_address_falls_back_to_from() {
        let raw = "From: a@b.test\r\nSubject: x\r\n\r\nbody\r\n";
        let env = MessageEnvelope::parse(MessageId(1), raw.as_bytes(), false).unwrap();
        assert_eq!(env.reply_address().unwrap().address, "a@b.test");
    }

    #[test]
    fn display_includes_name() {
        let addr = EmailAddress {
            name: Some("Work".into()),
            address: "user@workplace.test".into(),
        };
        assert_eq!(addr.display(), "Work <user@workplace.test>");
        assert_eq!(EmailAddress::new("x@y.test").display(), "x@y.test");
    }

    #[test]
    fn empty_input_is_unparseable() {
        assert!(MessageEnvelope::parse(MessageId(1), b"", false).is_none());
    }
}
