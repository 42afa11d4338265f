//! IMAP transport on the `imap` crate over rustls.
//!
//! `imap::Session` is blocking. [`ImapSession`] moves it into
//! `spawn_blocking` for every command and takes it back afterwards, so the
//! resilient loop stays the only owner.

use std::time::Duration;

use async_trait::async_trait;
use imap::extensions::idle::WaitOutcome;
use imap::types::UnsolicitedResponse;
use imap::{ClientBuilder, Connection, ConnectionMode, TlsKind};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info, warn};

use super::{FetchPart, MailboxEvent, MailboxSession, MailboxTransport, MessageId};
use crate::config::ImapConfig;
use crate::error::ConnectionError;
use crate::rules::compile::{SearchCapabilities, SearchCriterion};

type Session = imap::Session<Connection>;

/// Slack on top of the IDLE timeout before a wait counts as hung.
const IDLE_GRACE: Duration = Duration::from_secs(60);

// ── Transport ───────────────────────────────────────────────────────

/// Connects to the configured IMAP server over implicit TLS.
pub struct ImapTransport {
    config: ImapConfig,
    password: SecretString,
    capabilities: SearchCapabilities,
    command_timeout: Duration,
}

impl ImapTransport {
    pub fn new(config: ImapConfig, password: SecretString, capabilities: SearchCapabilities) -> Self {
        Self {
            config,
            password,
            capabilities,
            command_timeout: Duration::from_secs(60),
        }
    }
}

#[async_trait]
impl MailboxTransport for ImapTransport {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, ConnectionError> {
        let config = self.config.clone();
        let password = self.password.expose_secret().to_string();

        let task = tokio::task::spawn_blocking(move || open_session(&config, &password));
        let (session, server) = tokio::time::timeout(self.command_timeout, task)
            .await
            .map_err(|_| ConnectionError::Timeout(self.command_timeout))?
            .map_err(|e| ConnectionError::ConnectFailed {
                host: self.config.host.clone(),
                reason: format!("connect task panicked: {e}"),
            })??;

        info!(
            host = %self.config.host,
            mailbox = %self.config.mailbox,
            idle = server.idle,
            "IMAP session established"
        );
        Ok(Box::new(ImapSession {
            session: Some(session),
            server,
            command_timeout: self.command_timeout,
        }))
    }

    fn capabilities(&self) -> SearchCapabilities {
        self.capabilities
    }
}

/// Extensions the engine adapts to.
#[derive(Debug, Clone, Copy, Default)]
struct ServerCaps {
    idle: bool,
    mv: bool,
    uidplus: bool,
}

/// Connect, log in, read capabilities and select the mailbox.
fn open_session(config: &ImapConfig, password: &str) -> Result<(Session, ServerCaps), ConnectionError> {
    let client = ClientBuilder::new(config.host.as_str(), config.port)
        .mode(ConnectionMode::Tls)
        .tls_kind(TlsKind::Rust)
        .connect()
        .map_err(|e| ConnectionError::ConnectFailed {
            host: config.host.clone(),
            reason: e.to_string(),
        })?;

    let mut session = client.login(&config.user, password).map_err(|(e, _)| {
        warn!(user = %config.user, "IMAP login rejected: {e}");
        ConnectionError::AuthFailed {
            user: config.user.clone(),
        }
    })?;

    let caps = session.capabilities().map_err(imap_error)?;
    let server = ServerCaps {
        idle: caps.has_str("IDLE"),
        mv: caps.has_str("MOVE"),
        uidplus: caps.has_str("UIDPLUS"),
    };
    debug!(?server, "IMAP capabilities");

    session.select(&config.mailbox).map_err(imap_error)?;
    Ok((session, server))
}

fn imap_error(e: imap::Error) -> ConnectionError {
    match e {
        imap::Error::ConnectionLost => ConnectionError::Closed,
        other => ConnectionError::Imap(other),
    }
}

// ── Async session ───────────────────────────────────────────────────

/// Async wrapper around a blocking `imap::Session`.
pub struct ImapSession {
    session: Option<Session>,
    server: ServerCaps,
    command_timeout: Duration,
}

impl ImapSession {
    /// Run `op` on the session inside `spawn_blocking`.
    ///
    /// A command that outlives `limit`, or whose future is dropped, takes the
    /// session with it; every later call fails with [`ConnectionError::Closed`].
    async fn blocking<T, F>(&mut self, limit: Duration, op: F) -> Result<T, ConnectionError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Session, ServerCaps) -> imap::Result<T> + Send + 'static,
    {
        let mut session = self.session.take().ok_or(ConnectionError::Closed)?;
        let server = self.server;
        let task = tokio::task::spawn_blocking(move || {
            let result = op(&mut session, server);
            (session, result)
        });
        let (session, result) = tokio::time::timeout(limit, task)
            .await
            .map_err(|_| ConnectionError::Timeout(limit))?
            .map_err(|e| ConnectionError::Protocol(format!("IMAP task panicked: {e}")))?;
        self.session = Some(session);
        result.map_err(imap_error)
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn search(
        &mut self,
        criterion: &SearchCriterion,
    ) -> Result<Vec<MessageId>, ConnectionError> {
        let query = criterion.to_imap();
        let limit = self.command_timeout;
        let uids = self
            .blocking(limit, move |s, _| s.uid_search(&query))
            .await?;
        Ok(uids.into_iter().map(MessageId).collect())
    }

    async fn fetch(&mut self, id: MessageId, part: FetchPart) -> Result<Vec<u8>, ConnectionError> {
        let limit = self.command_timeout;
        let data = self
            .blocking(limit, move |s, _| {
                let fetches = s.uid_fetch(id.to_string(), fetch_query(part))?;
                Ok(fetches.iter().find_map(|f| {
                    let bytes = match part {
                        FetchPart::Header => f.header(),
                        FetchPart::Full => f.body(),
                    };
                    bytes.map(<[u8]>::to_vec)
                }))
            })
            .await?;
        data.ok_or_else(|| ConnectionError::Protocol(format!("no message data for UID {id}")))
    }

    async fn mark_seen(&mut self, id: MessageId) -> Result<(), ConnectionError> {
        let limit = self.command_timeout;
        self.blocking(limit, move |s, _| {
            s.uid_store(id.to_string(), r"+FLAGS.SILENT (\Seen)").map(drop)
        })
        .await
    }

    async fn move_to(&mut self, id: MessageId, folder: &str) -> Result<(), ConnectionError> {
        let folder = folder.to_string();
        let limit = self.command_timeout;
        self.blocking(limit, move |s, server| {
            let uid = id.to_string();
            if server.mv {
                return s.uid_mv(&uid, &folder);
            }
            s.uid_copy(&uid, &folder)?;
            delete_uid(s, server, &uid)
        })
        .await
    }

    async fn delete(&mut self, id: MessageId) -> Result<(), ConnectionError> {
        let limit = self.command_timeout;
        self.blocking(limit, move |s, server| delete_uid(s, server, &id.to_string()))
            .await
    }

    async fn wait_for_change(
        &mut self,
        timeout: Duration,
    ) -> Result<MailboxEvent, ConnectionError> {
        if self.session.is_none() {
            return Err(ConnectionError::Closed);
        }
        if !self.server.idle {
            debug!("server lacks IDLE; polling");
            tokio::time::sleep(timeout).await;
            return Ok(MailboxEvent::Timeout);
        }
        let outcome = self
            .blocking(timeout + IDLE_GRACE, move |s, _| {
                s.idle()
                    .timeout(timeout)
                    .keepalive(false)
                    .wait_while(|response| !is_change_notification(&response))
            })
            .await?;
        Ok(match outcome {
            WaitOutcome::MailboxChanged => {
                debug!("IDLE notification");
                MailboxEvent::Changed
            }
            WaitOutcome::TimedOut => MailboxEvent::Timeout,
        })
    }

    async fn logout(&mut self) {
        if self.session.is_none() {
            return;
        }
        let limit = self.command_timeout;
        if let Err(e) = self.blocking(limit, |s, _| s.logout()).await {
            debug!("IMAP logout failed: {e}");
        }
        self.session = None;
    }
}

fn fetch_query(part: FetchPart) -> &'static str {
    match part {
        FetchPart::Header => "BODY.PEEK[HEADER]",
        FetchPart::Full => "BODY.PEEK[]",
    }
}

/// Flag `\Deleted` and expunge, scoped to the UID when UIDPLUS allows it.
fn delete_uid(s: &mut Session, server: ServerCaps, uid: &str) -> imap::Result<()> {
    s.uid_store(uid, r"+FLAGS.SILENT (\Deleted)")?;
    if server.uidplus {
        s.uid_expunge(uid)?;
    } else {
        s.expunge()?;
    }
    Ok(())
}

/// Whether an unsolicited response received during IDLE means new or
/// removed mail.
fn is_change_notification(response: &UnsolicitedResponse) -> bool {
    matches!(
        response,
        UnsolicitedResponse::Exists(_)
            | UnsolicitedResponse::Recent(_)
            | UnsolicitedResponse::Expunge(_)
    )
}
