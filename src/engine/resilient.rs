//! Reconnecting loop: connect, pass, wait for change, repeat; back off
//! exponentially while the server is unreachable or a pass fails.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::Collaborators;
use super::runner::{PassReport, run_once};
use crate::error::ConnectionError;
use crate::mailbox::{MailboxEvent, MailboxSession, MailboxTransport};
use crate::rules::RuleTable;

/// Exponential retry delay between `floor` and `ceiling`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    floor: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(floor: Duration, ceiling: Duration) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            current: floor,
        }
    }

    /// The delay to wait now. Doubles the next one, up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.ceiling);
        delay
    }

    /// The delay the next failure will wait.
    pub fn peek(&self) -> Duration {
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.floor;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Disconnected,
    Connected,
    Processing,
    Waiting,
    Backoff,
    Stopped,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connected => "connected",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
            Self::Backoff => "backoff",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Timing knobs for the loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    /// Upper bound on one wait for mailbox change.
    pub idle_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            backoff_floor: Duration::from_secs(60),
            backoff_ceiling: Duration::from_secs(3600),
            // Just under the 29 minutes after which servers may drop IDLE.
            idle_timeout: Duration::from_secs(1739),
        }
    }
}

/// State threaded through the loop. Owned by the loop task alone.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub phase: LoopPhase,
    pub backoff: Backoff,
    pub consecutive_failures: u32,
    /// Completed passes, successful or not.
    pub passes: u64,
}

impl LoopState {
    pub fn new(settings: &LoopSettings) -> Self {
        Self {
            phase: LoopPhase::Disconnected,
            backoff: Backoff::new(settings.backoff_floor, settings.backoff_ceiling),
            consecutive_failures: 0,
            passes: 0,
        }
    }

    fn enter(&mut self, phase: LoopPhase) {
        debug!(from = %self.phase, to = %phase, "loop phase");
        self.phase = phase;
    }
}

/// Request shutdown when `signal` fires.
///
/// A signal listener that fails to install never requests shutdown; the
/// sender is held forever so the loop keeps running.
pub async fn relay_shutdown<S>(signal: S, shutdown: watch::Sender<bool>)
where
    S: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => {
            info!("interrupt received, shutting down");
            shutdown.send(true).ok();
        }
        Err(e) => {
            error!("cannot listen for interrupts: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Run until `shutdown` turns true. Transient faults never end the loop.
pub async fn run_forever(
    transport: &dyn MailboxTransport,
    table: &RuleTable,
    collaborators: &Collaborators,
    settings: &LoopSettings,
    mut shutdown: watch::Receiver<bool>,
) -> LoopState {
    let mut state = LoopState::new(settings);
    info!(rules = table.len(), "mail loop started");

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        state.enter(LoopPhase::Disconnected);
        let connected = tokio::select! {
            result = transport.connect() => result,
            _ = cancelled(&mut shutdown) => break,
        };
        let mut session = match connected {
            Ok(session) => session,
            Err(e) => {
                state.consecutive_failures += 1;
                warn!(failures = state.consecutive_failures, "connect failed: {e}");
                if !back_off(&mut state, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };
        state.enter(LoopPhase::Connected);
        info!("connected");

        loop {
            state.enter(LoopPhase::Processing);
            let report = run_once(session.as_mut(), table, collaborators).await;
            state.passes += 1;

            if let Some(failure) = &report.failure {
                state.consecutive_failures += 1;
                error!(
                    passes = state.passes,
                    uid = ?failure.message_id(),
                    "pass failed, reconnecting: {failure}"
                );
                session.logout().await;
                if !back_off(&mut state, &mut shutdown).await {
                    break 'outer;
                }
                continue 'outer;
            }

            state.consecutive_failures = 0;
            state.backoff.reset();
            state.enter(LoopPhase::Waiting);

            let waited = tokio::select! {
                result = session.wait_for_change(settings.idle_timeout) => result,
                _ = cancelled(&mut shutdown) => {
                    session.logout().await;
                    break 'outer;
                }
            };
            match waited {
                Ok(MailboxEvent::Changed) => debug!("mailbox changed"),
                Ok(MailboxEvent::Timeout) => debug!("idle timeout; polling"),
                Err(e) => {
                    warn!("connection lost while waiting: {e}");
                    session.logout().await;
                    continue 'outer;
                }
            }
        }
    }

    state.enter(LoopPhase::Stopped);
    info!(passes = state.passes, "mail loop stopped");
    state
}

/// Sleep for the next backoff delay. False if shutdown interrupted it.
async fn back_off(state: &mut LoopState, shutdown: &mut watch::Receiver<bool>) -> bool {
    state.enter(LoopPhase::Backoff);
    let delay = state.backoff.next_delay();
    info!(delay_secs = delay.as_secs(), "backing off");
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancelled(shutdown) => false,
    }
}

/// Connect, run one pass and log out.
pub async fn run_single_pass(
    transport: &dyn MailboxTransport,
    table: &RuleTable,
    collaborators: &Collaborators,
) -> Result<PassReport, ConnectionError> {
    let mut session: Box<dyn MailboxSession> = transport.connect().await?;
    let report = run_once(session.as_mut(), table, collaborators).await;
    session.logout().await;
    Ok(report)
}
