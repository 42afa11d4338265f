//! Handlers: the closed set of actions a rule can take.
//!
//! Each variant is a stateless strategy configured when the rule table is
//! built. [`Handler::execute`] performs exactly one action per invocation.

pub mod reply;
pub mod sent;

use std::fmt;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ActionError;
use crate::mailbox::{FetchPart, MailboxSession, MessageEnvelope};
use crate::outbound::{Attachment, MessageSender, OutboundMessage};
use crate::proxy::ContentProxy;

pub use reply::LocalizedText;
pub use sent::SentLog;

const FORWARD_NOTE: &str = "Forwarded message from {sender}";

/// Message-ID domains for generated mail.
pub const AWAY_DOMAIN: &str = "away";
pub const REJECT_DOMAIN: &str = "noteventrashcan";
pub const PROXY_DOMAIN: &str = "proxy";

/// Forward to a fixed address, optionally answering the sender.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ForwardAction {
    pub to: String,
    pub from: String,
    #[serde(default = "default_forward_note")]
    pub note: LocalizedText,
    #[serde(default)]
    pub auto_reply: Option<AutoReply>,
    /// Folder the original is moved to once forwarded.
    #[serde(default)]
    pub archive_to: Option<String>,
}

fn default_forward_note() -> LocalizedText {
    LocalizedText::english(FORWARD_NOTE)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutoReply {
    pub from: String,
    pub body: LocalizedText,
}

/// Polite rejection followed by deletion.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RejectAction {
    pub from: String,
    pub body: LocalizedText,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct ProxyAction {
    #[serde(default)]
    pub archive_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Handler {
    Forward(ForwardAction),
    Move { folder: String },
    /// Mark seen, then move.
    Archive { folder: String },
    ObnoxiousReject(RejectAction),
    ContentProxy(ProxyAction),
    NoOp,
}

/// Handler variant without its parameters, for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    Forward,
    Move,
    Archive,
    ObnoxiousReject,
    ContentProxy,
    NoOp,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Forward => "forward",
            Self::Move => "move",
            Self::Archive => "archive",
            Self::ObnoxiousReject => "obnoxious_reject",
            Self::ContentProxy => "content_proxy",
            Self::NoOp => "no_op",
        };
        f.write_str(name)
    }
}

/// What a handler may touch while executing.
pub struct ActionContext<'a> {
    pub session: &'a mut dyn MailboxSession,
    pub sender: &'a dyn MessageSender,
    pub proxy: Option<&'a ContentProxy>,
    /// Skips repeat sends for messages whose mailbox step failed earlier.
    pub sent: Option<&'a SentLog>,
}

impl ActionContext<'_> {
    fn already_sent(&self, handler: HandlerKind, env: &MessageEnvelope) -> bool {
        match (self.sent, env.message_id.as_deref()) {
            (Some(log), Some(message_id)) => log.contains(handler, message_id),
            _ => false,
        }
    }

    fn record_sent(&self, handler: HandlerKind, env: &MessageEnvelope) {
        if let (Some(log), Some(message_id)) = (self.sent, env.message_id.as_deref()) {
            log.record(handler, message_id);
        }
    }
}

impl Handler {
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Forward(_) => HandlerKind::Forward,
            Self::Move { .. } => HandlerKind::Move,
            Self::Archive { .. } => HandlerKind::Archive,
            Self::ObnoxiousReject(_) => HandlerKind::ObnoxiousReject,
            Self::ContentProxy(_) => HandlerKind::ContentProxy,
            Self::NoOp => HandlerKind::NoOp,
        }
    }

    /// Every address the handler sends from or to.
    pub fn addresses(&self) -> Vec<&str> {
        match self {
            Self::Forward(f) => {
                let mut out = vec![f.to.as_str(), f.from.as_str()];
                if let Some(reply) = &f.auto_reply {
                    out.push(reply.from.as_str());
                }
                out
            }
            Self::ObnoxiousReject(r) => vec![r.from.as_str()],
            _ => Vec::new(),
        }
    }

    pub async fn execute(
        &self,
        env: &MessageEnvelope,
        ctx: &mut ActionContext<'_>,
    ) -> Result<(), ActionError> {
        match self {
            Self::Forward(action) => forward(action, env, ctx).await,
            Self::Move { folder } => ctx
                .session
                .move_to(env.id, folder)
                .await
                .map_err(|e| ActionError::transient(env.id, e)),
            Self::Archive { folder } => {
                ctx.session
                    .mark_seen(env.id)
                    .await
                    .map_err(|e| ActionError::transient(env.id, e))?;
                ctx.session
                    .move_to(env.id, folder)
                    .await
                    .map_err(|e| ActionError::transient(env.id, e))
            }
            Self::ObnoxiousReject(action) => reject(action, env, ctx).await,
            Self::ContentProxy(action) => content_proxy(action, env, ctx).await,
            Self::NoOp => Ok(()),
        }
    }
}

// ── Forward ─────────────────────────────────────────────────────────

async fn forward(
    action: &ForwardAction,
    env: &MessageEnvelope,
    ctx: &mut ActionContext<'_>,
) -> Result<(), ActionError> {
    let id = env.id;
    if ctx.already_sent(HandlerKind::Forward, env) {
        info!(uid = %id, "already forwarded; finishing mailbox steps");
        return finish(ctx, env, action.archive_to.as_deref()).await;
    }

    let raw = ctx
        .session
        .fetch(id, FetchPart::Full)
        .await
        .map_err(|e| ActionError::transient(id, e))?;

    let sender = env
        .reply_address()
        .map(|a| a.display())
        .ok_or_else(|| ActionError::permanent(id, "message has no sender"))?;
    let lang = env.content_language.as_deref();

    let fwd = OutboundMessage::new(
        &action.from,
        &action.to,
        reply::prefixed("Fwd:", &env.subject),
        action.note.render(lang, &sender),
    )
    .reply_to(sender.clone())
    .in_reply_to(env.message_id.clone())
    .attach(Attachment {
        filename: "forwarded.eml".into(),
        content_type: "message/rfc822".into(),
        data: raw,
    });

    ctx.sender
        .send(&fwd)
        .await
        .map_err(|e| ActionError::transient(id, e))?;
    ctx.record_sent(HandlerKind::Forward, env);
    info!(uid = %id, to = %action.to, "forwarded");

    if let Some(auto) = &action.auto_reply {
        let body = auto.body.render(lang, &sender);
        if let Some(reply) = reply::build_reply(env, &auto.from, body, AWAY_DOMAIN) {
            let reply = reply.reply_to(action.to.clone());
            if let Err(e) = ctx.sender.send(&reply).await {
                warn!(uid = %id, to = %sender, "auto-reply failed: {e}");
            }
        }
    }

    finish(ctx, env, action.archive_to.as_deref()).await
}

/// Mark seen, then move to `archive_to` if set.
async fn finish(
    ctx: &mut ActionContext<'_>,
    env: &MessageEnvelope,
    archive_to: Option<&str>,
) -> Result<(), ActionError> {
    let id = env.id;
    ctx.session
        .mark_seen(id)
        .await
        .map_err(|e| ActionError::transient(id, e))?;
    if let Some(folder) = archive_to {
        ctx.session
            .move_to(id, folder)
            .await
            .map_err(|e| ActionError::transient(id, e))?;
    }
    Ok(())
}

// ── Obnoxious reject ────────────────────────────────────────────────

async fn reject(
    action: &RejectAction,
    env: &MessageEnvelope,
    ctx: &mut ActionContext<'_>,
) -> Result<(), ActionError> {
    let id = env.id;
    let sender = env.sender();
    let body = action.body.render(env.content_language.as_deref(), &sender);

    if ctx.already_sent(HandlerKind::ObnoxiousReject, env) {
        info!(uid = %id, "rejection already sent; deleting");
    } else {
        match reply::build_reply(env, &action.from, body, REJECT_DOMAIN) {
            Some(reply) => {
                ctx.sender
                    .send(&reply)
                    .await
                    .map_err(|e| ActionError::transient(id, e))?;
                ctx.record_sent(HandlerKind::ObnoxiousReject, env);
                info!(uid = %id, to = %reply.to, "rejection sent");
            }
            None => warn!(uid = %id, "no reply address; deleting without reply"),
        }
    }

    ctx.session
        .delete(id)
        .await
        .map_err(|e| ActionError::transient(id, e))
}

// ── Content proxy ───────────────────────────────────────────────────

async fn content_proxy(
    action: &ProxyAction,
    env: &MessageEnvelope,
    ctx: &mut ActionContext<'_>,
) -> Result<(), ActionError> {
    let id = env.id;
    let proxy = ctx
        .proxy
        .ok_or_else(|| ActionError::permanent(id, "content proxy not configured"))?;
    if ctx.already_sent(HandlerKind::ContentProxy, env) {
        info!(uid = %id, "proxy output already sent; finishing mailbox steps");
        return finish(ctx, env, action.archive_to.as_deref()).await;
    }

    let raw = ctx
        .session
        .fetch(id, FetchPart::Full)
        .await
        .map_err(|e| ActionError::transient(id, e))?;

    let outgoing = proxy.process(env, &raw).await;
    if outgoing.is_empty() {
        info!(uid = %id, "no fetchable links in proxy request");
    }
    for message in &outgoing {
        ctx.sender
            .send(message)
            .await
            .map_err(|e| ActionError::transient(id, e))?;
    }
    if !outgoing.is_empty() {
        ctx.record_sent(HandlerKind::ContentProxy, env);
    }

    finish(ctx, env, action.archive_to.as_deref()).await
}
