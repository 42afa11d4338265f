//! In-memory doubles for the mailbox, the SMTP sender and the HTTP fetcher.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{ConnectionError, ProxyError, SendError};
use crate::mailbox::{
    EmailAddress, FetchPart, MailboxEvent, MailboxSession, MailboxTransport, MessageEnvelope,
    MessageId,
};
use crate::outbound::{MessageSender, OutboundMessage};
use crate::proxy::{FetchedContent, PageFetcher};
use crate::rules::compile::{SearchCapabilities, SearchCriterion};

const INBOX: &str = "INBOX";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Envelope with one From and one To address and no body.
pub fn envelope(id: u32, from: &str, to: &str, subject: &str) -> MessageEnvelope {
    MessageEnvelope {
        id: MessageId(id),
        from: vec![EmailAddress::new(from)],
        to: vec![EmailAddress::new(to)],
        cc: Vec::new(),
        reply_to: Vec::new(),
        subject: subject.to_string(),
        message_id: None,
        content_language: None,
        received_at: Utc::now(),
        body: None,
    }
}

/// A minimal RFC 822 message.
pub fn raw_message(from: &str, to: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {from}\r\nTo: {to}\r\nSubject: {subject}\r\n\
         Message-ID: <{}@memory.test>\r\n\
         Date: Mon, 6 Jan 2025 10:00:00 +0000\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n",
        uuid::Uuid::new_v4()
    )
    .into_bytes()
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// What a scripted `wait_for_change` call does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Changed,
    Timeout,
    /// The connection drops while waiting.
    Lost,
}

/// Operation kinds that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOp {
    Fetch,
    MarkSeen,
    Move,
    Delete,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    raw: Vec<u8>,
    envelope: MessageEnvelope,
    seen: bool,
    folder: String,
}

#[derive(Default)]
struct MailboxState {
    messages: BTreeMap<MessageId, StoredMessage>,
    next_id: u32,
    failures: HashSet<(FailOp, MessageId)>,
    fail_searches: usize,
    connect_script: VecDeque<bool>,
    wait_script: VecDeque<WaitOutcome>,
    connect_times: Vec<tokio::time::Instant>,
    fetches: Vec<(MessageId, FetchPart)>,
    searches: Vec<String>,
}

/// Shared in-memory mailbox. Clones share state, so a test can keep one
/// handle for assertions while the engine drives another.
#[derive(Clone)]
pub struct MemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
    capabilities: SearchCapabilities,
}

impl Default for MemoryMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::with_capabilities(SearchCapabilities::IMAP)
    }

    pub fn with_capabilities(capabilities: SearchCapabilities) -> Self {
        Self {
            state: Arc::new(Mutex::new(MailboxState {
                next_id: 1,
                ..Default::default()
            })),
            capabilities,
        }
    }

    /// Deliver a message to the inbox with the next free id.
    pub fn add(&self, raw: &[u8]) -> MessageId {
        let id = MessageId(lock(&self.state).next_id);
        self.add_with_id(id, raw);
        id
    }

    /// Deliver a message with a chosen id. Unparseable bytes are stored with
    /// an empty envelope.
    pub fn add_with_id(&self, id: MessageId, raw: &[u8]) {
        let envelope = MessageEnvelope::parse(id, raw, true).unwrap_or_else(|| {
            let mut env = envelope(id.0, "", "", "");
            env.from.clear();
            env.to.clear();
            env
        });
        let mut state = lock(&self.state);
        state.next_id = state.next_id.max(id.0 + 1);
        state.messages.insert(
            id,
            StoredMessage {
                raw: raw.to_vec(),
                envelope,
                seen: false,
                folder: INBOX.to_string(),
            },
        );
    }

    /// The parsed envelope (with body) of a stored message.
    pub fn envelope(&self, id: MessageId) -> Option<MessageEnvelope> {
        lock(&self.state).messages.get(&id).map(|m| m.envelope.clone())
    }

    pub fn exists(&self, id: MessageId) -> bool {
        lock(&self.state).messages.contains_key(&id)
    }

    pub fn is_seen(&self, id: MessageId) -> bool {
        lock(&self.state).messages.get(&id).is_some_and(|m| m.seen)
    }

    pub fn folder_of(&self, id: MessageId) -> Option<String> {
        lock(&self.state).messages.get(&id).map(|m| m.folder.clone())
    }

    pub fn fail(&self, op: FailOp, id: MessageId) {
        lock(&self.state).failures.insert((op, id));
    }

    pub fn fail_move(&self, id: MessageId) {
        self.fail(FailOp::Move, id);
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Make the next `n` searches fail.
    pub fn fail_searches(&self, n: usize) {
        lock(&self.state).fail_searches = n;
    }

    /// Outcomes of upcoming connect attempts (`false` = fail). Once the
    /// script runs out every connect succeeds.
    pub fn script_connects(&self, outcomes: impl IntoIterator<Item = bool>) {
        lock(&self.state).connect_script.extend(outcomes);
    }

    /// Outcomes of upcoming waits. Once the script runs out a wait sleeps
    /// for its full timeout.
    pub fn script_waits(&self, outcomes: impl IntoIterator<Item = WaitOutcome>) {
        lock(&self.state).wait_script.extend(outcomes);
    }

    /// Instants of every connect attempt, successful or not.
    pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
        lock(&self.state).connect_times.clone()
    }

    /// Every fetch, in order.
    pub fn fetches(&self) -> Vec<(MessageId, FetchPart)> {
        lock(&self.state).fetches.clone()
    }

    /// IMAP rendering of every search, in order.
    pub fn searches(&self) -> Vec<String> {
        lock(&self.state).searches.clone()
    }
}

#[async_trait]
impl MailboxTransport for MemoryMailbox {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, ConnectionError> {
        let ok = {
            let mut state = lock(&self.state);
            state.connect_times.push(tokio::time::Instant::now());
            state.connect_script.pop_front().unwrap_or(true)
        };
        if !ok {
            return Err(ConnectionError::ConnectFailed {
                host: "memory".into(),
                reason: "scripted failure".into(),
            });
        }
        Ok(Box::new(MemorySession {
            mailbox: self.clone(),
            alive: true,
        }))
    }

    fn capabilities(&self) -> SearchCapabilities {
        self.capabilities
    }
}

pub struct MemorySession {
    mailbox: MemoryMailbox,
    alive: bool,
}

impl MemorySession {
    fn state(&self) -> Result<MutexGuard<'_, MailboxState>, ConnectionError> {
        if self.alive {
            Ok(lock(&self.mailbox.state))
        } else {
            Err(ConnectionError::Closed)
        }
    }

    fn apply<F>(&mut self, op: FailOp, id: MessageId, f: F) -> Result<(), ConnectionError>
    where
        F: FnOnce(&mut MailboxState),
    {
        let mut state = self.state()?;
        if state.failures.contains(&(op, id)) {
            return Err(ConnectionError::CommandFailed {
                command: format!("{op:?}"),
                reason: format!("injected failure on {id}"),
            });
        }
        if !state.messages.get(&id).is_some_and(|m| m.folder == INBOX) {
            return Err(ConnectionError::CommandFailed {
                command: format!("{op:?}"),
                reason: format!("no message {id}"),
            });
        }
        f(&mut state);
        Ok(())
    }
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn search(
        &mut self,
        criterion: &SearchCriterion,
    ) -> Result<Vec<MessageId>, ConnectionError> {
        let mut state = self.state()?;
        state.searches.push(criterion.to_imap());
        if state.fail_searches > 0 {
            state.fail_searches -= 1;
            return Err(ConnectionError::CommandFailed {
                command: "SEARCH".into(),
                reason: "injected failure".into(),
            });
        }
        Ok(state
            .messages
            .iter()
            .filter(|(_, m)| m.folder == INBOX && criterion.matches(&m.envelope, m.seen))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, ConnectionError> {
        let mut raw = Vec::new();
        self.apply(FailOp::Fetch, id, |state| {
            state.fetches.push((id, part));
            if let Some(m) = state.messages.get(&id) {
                raw = match part {
                    FetchPart::Full => m.raw.clone(),
                    FetchPart::Header => header_block(&m.raw).to_vec(),
                };
            }
        })?;
        Ok(raw)
    }

    async fn mark_seen(&mut self, id: MessageId) -> Result<(), ConnectionError> {
        self.apply(FailOp::MarkSeen, id, |state| {
            if let Some(m) = state.messages.get_mut(&id) {
                m.seen = true;
            }
        })
    }

    async fn move_to(&mut self, id: MessageId, folder: &str) -> Result<(), ConnectionError> {
        self.apply(FailOp::Move, id, |state| {
            if let Some(m) = state.messages.get_mut(&id) {
                m.folder = folder.to_string();
            }
        })
    }

    async fn delete(&mut self, id: MessageId) -> Result<(), ConnectionError> {
        self.apply(FailOp::Delete, id, |state| {
            state.messages.remove(&id);
        })
    }

    async fn wait_for_change(
        &mut self,
        timeout: Duration,
    ) -> Result<MailboxEvent, ConnectionError> {
        let next = self.state()?.wait_script.pop_front();
        match next {
            Some(WaitOutcome::Changed) => Ok(MailboxEvent::Changed),
            Some(WaitOutcome::Timeout) => Ok(MailboxEvent::Timeout),
            Some(WaitOutcome::Lost) => {
                self.alive = false;
                Err(ConnectionError::Closed)
            }
            None => {
                tokio::time::sleep(timeout).await;
                Ok(MailboxEvent::Timeout)
            }
        }
    }

    async fn logout(&mut self) {
        self.alive = false;
    }
}

fn header_block(raw: &[u8]) -> &[u8] {
    raw.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| &raw[..pos + 4])
        .unwrap_or(raw)
}

// ── Sender ──────────────────────────────────────────────────────────

/// Records every message instead of sending it.
#[derive(Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<HashSet<String>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send whose `to` equals `address`.
    pub fn fail_to(&self, address: &str) {
        lock(&self.failing).insert(address.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.failing).clear();
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl MessageSender for RecordingSender {
    async fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        if lock(&self.failing).contains(&message.to) {
            return Err(SendError::Delivery {
                to: message.to.clone(),
                reason: "injected failure".into(),
            });
        }
        lock(&self.sent).push(message.clone());
        Ok(())
    }
}

// ── Fetcher ─────────────────────────────────────────────────────────

/// Serves canned responses keyed by URL and counts requests.
#[derive(Default)]
pub struct StaticFetcher {
    pages: Mutex<HashMap<String, FetchedContent>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `content` for `content.url`.
    pub fn insert(&self, content: FetchedContent) {
        lock(&self.pages).insert(content.url.clone(), content);
    }

    pub fn calls(&self, url: &str) -> usize {
        lock(&self.calls).get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(
        &self,
        url: &str,
        _timeout: Duration,
        max_size: usize,
    ) -> Result<FetchedContent, ProxyError> {
        *lock(&self.calls).entry(url.to_string()).or_default() += 1;
        let page = lock(&self.pages).get(url).cloned();
        match page {
            Some(page) if page.body.len() > max_size => Err(ProxyError::TooLarge {
                url: url.to_string(),
                limit: max_size,
            }),
            Some(page) => Ok(page),
            None => Err(ProxyError::Fetch {
                url: url.to_string(),
                reason: "404 Not Found".into(),
            }),
        }
    }
}
