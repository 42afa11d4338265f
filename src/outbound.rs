//! Outbound mail: message model and the SMTP sender.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;
use uuid::Uuid;

use crate::config::SmtpConfig;
use crate::error::SendError;

/// A file attached to an outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// A message to be sent. Addresses are RFC 5322 mailbox strings
/// (`Name <addr>` or a bare address).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutboundMessage {
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: String,
    /// Content type of the body part. Defaults to text/plain.
    pub body_content_type: Option<String>,
    pub reply_to: Option<String>,
    /// Message-ID (with angle brackets) this message answers or forwards.
    pub in_reply_to: Option<String>,
    /// Domain used for the generated Message-ID.
    pub message_id_domain: Option<String>,
    pub attachments: Vec<Attachment>,
}

impl OutboundMessage {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        subject: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            subject: subject.into(),
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn in_reply_to(mut self, message_id: Option<String>) -> Self {
        self.in_reply_to = message_id;
        self
    }

    pub fn message_id_domain(mut self, domain: impl Into<String>) -> Self {
        self.message_id_domain = Some(domain.into());
        self
    }

    pub fn body_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.body_content_type = Some(content_type.into());
        self
    }

    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Build the lettre message.
    pub fn to_lettre(&self) -> Result<Message, SendError> {
        let mut builder = Message::builder()
            .from(parse_mailbox(&self.from)?)
            .to(parse_mailbox(&self.to)?)
            .subject(self.subject.clone())
            .date_now();

        if let Some(reply_to) = &self.reply_to {
            builder = builder.reply_to(parse_mailbox(reply_to)?);
        }
        if let Some(parent) = &self.in_reply_to {
            builder = builder
                .in_reply_to(parent.clone())
                .references(parent.clone());
        }
        builder = builder.message_id(
            self.message_id_domain
                .as_ref()
                .map(|domain| format!("<{}@{domain}>", Uuid::new_v4())),
        );

        let body_type = match &self.body_content_type {
            Some(ct) => parse_content_type(ct)?,
            None => ContentType::TEXT_PLAIN,
        };
        let body_part = SinglePart::builder()
            .header(body_type)
            .body(self.body.clone());

        let built = if self.attachments.is_empty() {
            builder.singlepart(body_part)
        } else {
            let mut multipart = MultiPart::mixed().singlepart(body_part);
            for att in &self.attachments {
                multipart = multipart.singlepart(
                    lettre::message::Attachment::new(att.filename.clone())
                        .body(att.data.clone(), parse_content_type(&att.content_type)?),
                );
            }
            builder.multipart(multipart)
        };

        built.map_err(|e| SendError::Build(e.to_string()))
    }
}

/// Parse a mailbox string, reporting the offending address on failure.
pub fn parse_mailbox(address: &str) -> Result<Mailbox, SendError> {
    address.parse().map_err(|e| SendError::InvalidAddress {
        address: address.to_string(),
        reason: format!("{e}"),
    })
}

fn parse_content_type(value: &str) -> Result<ContentType, SendError> {
    ContentType::parse(value).map_err(|e| SendError::Build(format!("content type {value}: {e}")))
}

/// Sends outbound messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError>;
}

/// SMTP submission over implicit TLS.
pub struct SmtpSender {
    host: String,
    port: u16,
    user: String,
    password: SecretString,
}

impl SmtpSender {
    pub fn new(config: &SmtpConfig, password: SecretString) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            user: config.user.clone(),
            password,
        }
    }
}

#[async_trait]
impl MessageSender for SmtpSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        let email = message.to_lettre()?;

        let creds = Credentials::new(
            self.user.clone(),
            self.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&self.host)
            .map_err(|e| SendError::Relay(e.to_string()))?
            .port(self.port)
            .credentials(creds)
            .build();

        let to = message.to.clone();
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| SendError::Delivery {
                to: to.clone(),
                reason: format!("send task panicked: {e}"),
            })?
            .map_err(|e| SendError::Delivery {
                to: to.clone(),
                reason: e.to_string(),
            })?;

        info!(to = %message.to, subject = %message.subject, "message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(msg: &OutboundMessage) -> String {
        String::from_utf8_lossy(&msg.to_lettre().unwrap().formatted()).into_owned()
    }

    #[test]
    fn reply_headers_rendered() {
        let msg = OutboundMessage::new(
            "Answermachine <devnull@example.test>",
            "spammer@spam.test",
            "Re: Offer",
            "No thanks",
        )
        .in_reply_to(Some("<abc@spam.test>".into()))
        .message_id_domain("noteventrashcan");

        let text = render(&msg);
        assert!(text.contains("In-Reply-To: <abc@spam.test>"));
        assert!(text.contains("References: <abc@spam.test>"));
        assert!(text.contains("@noteventrashcan>"));
        assert!(text.contains("Subject: Re: Offer"));
    }

    #[test]
    fn attachment_makes_multipart() {
        let msg = OutboundMessage::new("a@example.test", "b@example.test", "Fwd: x", "note").attach(
            Attachment {
                filename: "forwarded.eml".into(),
                content_type: "message/rfc822".into(),
                data: b"Subject: x\r\n\r\nbody\r\n".to_vec(),
            },
        );
        let text = render(&msg);
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("message/rfc822"));
        assert!(text.contains("forwarded.eml"));
    }

    #[test]
    fn reply_to_is_set() {
        let msg = OutboundMessage::new("a@example.test", "b@example.test", "s", "b")
            .reply_to("Work <user@workplace.test>");
        assert!(render(&msg).contains("Reply-To: Work <user@workplace.test>"));
    }

    #[test]
    fn invalid_address_reported() {
        let msg = OutboundMessage::new("not an address", "b@example.test", "s", "b");
        match msg.to_lettre() {
            Err(SendError::InvalidAddress { address, .. }) => assert_eq!(address, "not an address"),
            other => panic!("expected invalid address, got {other:?}"),
        }
    }
}
