//! Error types for mailbot.

use std::time::Duration;

use crate::mailbox::MessageId;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

/// Configuration-related errors. Always fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Malformed predicate in rule {rule}: {reason}")]
    MalformedPredicate { rule: String, reason: String },

    #[error("Empty credentials: {0}")]
    EmptyCredentials(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Mailbox transport errors. Recoverable: the loop backs off and reconnects.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}: {reason}")]
    ConnectFailed { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("Command {command} failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Connection closed by server")]
    Closed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Malformed server response: {0}")]
    Protocol(String),

    #[error("IMAP error: {0}")]
    Imap(#[from] imap::Error),
}

/// Handler-level failures. Either kind halts the current pass; the message
/// stays unprocessed and is picked up again by the next pass.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Transient failure on message {id}: {reason}")]
    Transient { id: MessageId, reason: String },

    #[error("Permanent failure on message {id}: {reason}")]
    Permanent { id: MessageId, reason: String },
}

impl ActionError {
    pub fn transient(id: MessageId, reason: impl ToString) -> Self {
        Self::Transient {
            id,
            reason: reason.to_string(),
        }
    }

    pub fn permanent(id: MessageId, reason: impl ToString) -> Self {
        Self::Permanent {
            id,
            reason: reason.to_string(),
        }
    }

    /// The message the failure belongs to.
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Transient { id, .. } | Self::Permanent { id, .. } => *id,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Outbound mail errors.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("Invalid address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to build message: {0}")]
    Build(String),

    #[error("SMTP relay error: {0}")]
    Relay(String),

    #[error("SMTP send to {to} failed: {reason}")]
    Delivery { to: String, reason: String },
}

/// Content proxy errors (URL fetch, cache, conversion).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Content of {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
