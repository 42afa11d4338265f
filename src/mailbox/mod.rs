//! Mailbox transport: the session the engine drives.
//!
//! The engine only ever talks to a [`MailboxSession`] obtained from a
//! [`MailboxTransport`]. The IMAP implementation lives in [`imap`]; an
//! in-memory double lives in [`crate::testing`].

pub mod envelope;
pub mod imap;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::rules::compile::{SearchCapabilities, SearchCriterion};

pub use envelope::{EmailAddress, MessageEnvelope};

/// Mailbox-assigned message identifier (IMAP UID). Stable within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u32);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which part of a message to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPart {
    /// Header block only.
    Header,
    /// The complete RFC 822 message.
    Full,
}

/// Result of waiting for mailbox activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailboxEvent {
    /// The server reported a change (new mail, expunge, flag change).
    Changed,
    /// Nothing happened before the timeout elapsed.
    Timeout,
}

/// Opens sessions against the watched mailbox.
#[async_trait]
pub trait MailboxTransport: Send + Sync {
    /// Connect, authenticate and select the watched mailbox.
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, ConnectionError>;

    /// What the transport's search language can express natively.
    fn capabilities(&self) -> SearchCapabilities;
}

/// A live, authenticated session with the watched mailbox selected.
///
/// Fetches never set `\Seen`; only [`MailboxSession::mark_seen`] does.
#[async_trait]
pub trait MailboxSession: Send {
    /// Run a search and return matching ids (in server order).
    async fn search(
        &mut self,
        criterion: &SearchCriterion,
    ) -> Result<Vec<MessageId>, ConnectionError>;

    /// Fetch the raw bytes of one message.
    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, ConnectionError>;

    /// Set the `\Seen` flag.
    async fn mark_seen(&mut self, id: MessageId) -> Result<(), ConnectionError>;

    /// Move the message to another folder.
    async fn move_to(&mut self, id: MessageId, folder: &str) -> Result<(), ConnectionError>;

    /// Delete and expunge the message.
    async fn delete(&mut self, id: MessageId) -> Result<(), ConnectionError>;

    /// Block until the mailbox changes or `timeout` elapses.
    async fn wait_for_change(&mut self, timeout: Duration)
    -> Result<MailboxEvent, ConnectionError>;

    /// Best-effort logout. Errors are logged, never returned.
    async fn logout(&mut self);
}
