//! Single pass: search, fetch and dispatch every unseen message, oldest
//! first, stopping at the first failure.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, info, warn};

use super::Collaborators;
use crate::error::{ActionError, ConnectionError};
use crate::handlers::{ActionContext, HandlerKind};
use crate::mailbox::{FetchPart, MailboxSession, MessageEnvelope, MessageId};
use crate::rules::{Candidates, DispatchOutcome, RuleTable, SearchCriterion};

/// Why a pass stopped early.
#[derive(Debug)]
pub enum PassFailure {
    /// A search failed before any message was touched.
    Search(ConnectionError),
    Fetch {
        id: MessageId,
        source: ConnectionError,
    },
    /// The fetched bytes could not be parsed into an envelope.
    Unclassifiable { error: ActionError },
    Action {
        rule: usize,
        rule_name: String,
        handler: HandlerKind,
        error: ActionError,
    },
}

impl PassFailure {
    /// The message the pass stopped at, if it got that far.
    pub fn message_id(&self) -> Option<MessageId> {
        match self {
            Self::Search(_) => None,
            Self::Fetch { id, .. } => Some(*id),
            Self::Unclassifiable { error } | Self::Action { error, .. } => Some(error.message_id()),
        }
    }

    /// Whether the failure came from the connection itself rather than a
    /// handler.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, Self::Search(_) | Self::Fetch { .. })
    }
}

impl fmt::Display for PassFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Search(e) => write!(f, "search failed: {e}"),
            Self::Fetch { id, source } => write!(f, "fetch of {id} failed: {source}"),
            Self::Unclassifiable { error } => write!(f, "{error}"),
            Self::Action {
                rule,
                rule_name,
                handler,
                error,
            } => write!(f, "rule #{rule} ({rule_name}) {handler} failed: {error}"),
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Default)]
pub struct PassReport {
    /// Messages dispatched without failure, in dispatch order.
    pub processed: Vec<MessageId>,
    /// How many of them matched a rule.
    pub matched: usize,
    pub failure: Option<PassFailure>,
}

impl PassReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run one pass over the unseen messages in the selected mailbox.
pub async fn run_once(
    session: &mut dyn MailboxSession,
    table: &RuleTable,
    collaborators: &Collaborators,
) -> PassReport {
    let mut report = PassReport::default();

    let (mut ids, candidates) = match search_candidates(session, table).await {
        Ok(found) => found,
        Err(e) => {
            warn!("search failed: {e}");
            report.failure = Some(PassFailure::Search(e));
            return report;
        }
    };
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        debug!("no unseen messages");
        return report;
    }
    info!(unseen = ids.len(), "pass started");

    let part = if table.needs_body() {
        FetchPart::Full
    } else {
        FetchPart::Header
    };

    let mut ctx = ActionContext {
        session,
        sender: collaborators.sender.as_ref(),
        proxy: collaborators.proxy.as_deref(),
        sent: Some(collaborators.sent.as_ref()),
    };

    for id in ids {
        if !candidates.any_contains(id) {
            debug!(uid = %id, "no candidate rule; skipped");
            report.processed.push(id);
            continue;
        }

        let raw = match ctx.session.fetch(id, part).await {
            Ok(raw) => raw,
            Err(source) => {
                warn!(uid = %id, "fetch failed: {source}");
                report.failure = Some(PassFailure::Fetch { id, source });
                break;
            }
        };

        let Some(env) = MessageEnvelope::parse(id, &raw, part == FetchPart::Full) else {
            let error = ActionError::permanent(id, "message could not be parsed");
            warn!(uid = %id, "{error}");
            report.failure = Some(PassFailure::Unclassifiable { error });
            break;
        };

        match table.dispatch(&env, &candidates, &mut ctx).await {
            DispatchOutcome::NoMatch => report.processed.push(id),
            DispatchOutcome::Succeeded { .. } => {
                report.processed.push(id);
                report.matched += 1;
            }
            DispatchOutcome::Failed {
                rule,
                rule_name,
                handler,
                error,
            } => {
                report.failure = Some(PassFailure::Action {
                    rule,
                    rule_name,
                    handler,
                    error,
                });
                break;
            }
        }
    }

    match &report.failure {
        None => info!(
            processed = report.processed.len(),
            matched = report.matched,
            "pass complete"
        ),
        Some(failure) => warn!(
            processed = report.processed.len(),
            uid = ?failure.message_id(),
            "pass halted: {failure}"
        ),
    }
    report
}

/// Unseen ids plus one candidate set per rule, each from a single search.
async fn search_candidates(
    session: &mut dyn MailboxSession,
    table: &RuleTable,
) -> Result<(Vec<MessageId>, Candidates), ConnectionError> {
    let unseen = session.search(&SearchCriterion::Unseen).await?;
    if unseen.is_empty() {
        return Ok((unseen, Candidates::default()));
    }

    let mut sets = Vec::with_capacity(table.len());
    for rule in table.rules() {
        let criterion = &rule.compiled.criterion;
        let set: HashSet<MessageId> = if criterion.is_nothing() {
            HashSet::new()
        } else {
            let scoped = SearchCriterion::And(vec![SearchCriterion::Unseen, criterion.clone()]);
            session.search(&scoped).await?.into_iter().collect()
        };
        debug!(rule = %rule.name, candidates = set.len(), "rule searched");
        sets.push(set);
    }
    Ok((unseen, Candidates::from_sets(sets)))
}
