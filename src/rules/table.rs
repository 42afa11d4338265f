//! Ordered rule table and first-match dispatch.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::compile::{CompiledCriterion, SearchCapabilities, compile};
use super::predicate::{Field, Predicate};
use crate::error::ActionError;
use crate::handlers::{ActionContext, Handler, HandlerKind};
use crate::mailbox::{MessageEnvelope, MessageId};

/// One classification rule.
#[derive(Debug, Clone)]
pub struct Rule {
    /// Declaration index, 0-based.
    pub index: usize,
    pub name: String,
    pub predicate: Predicate,
    pub compiled: CompiledCriterion,
    pub handler: Handler,
}

/// Rules in declaration order. Immutable once built.
#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<Rule>,
    capabilities: SearchCapabilities,
}

/// Per-rule candidate sets from the batched server-side searches.
#[derive(Debug, Clone, Default)]
pub struct Candidates {
    sets: Vec<HashSet<MessageId>>,
    unrestricted: bool,
}

impl Candidates {
    /// One set per rule, in rule order.
    pub fn from_sets(sets: Vec<HashSet<MessageId>>) -> Self {
        Self {
            sets,
            unrestricted: false,
        }
    }

    /// Every message is a candidate for every rule; selection relies on the
    /// local predicate alone.
    pub fn everything() -> Self {
        Self {
            sets: Vec::new(),
            unrestricted: true,
        }
    }

    pub fn contains(&self, rule: usize, id: MessageId) -> bool {
        self.unrestricted || self.sets.get(rule).is_some_and(|s| s.contains(&id))
    }

    /// Whether any rule could possibly select `id`.
    pub fn any_contains(&self, id: MessageId) -> bool {
        self.unrestricted || self.sets.iter().any(|s| s.contains(&id))
    }
}

/// Result of dispatching one message.
#[derive(Debug)]
pub enum DispatchOutcome {
    NoMatch,
    Succeeded {
        rule: usize,
        rule_name: String,
        handler: HandlerKind,
    },
    Failed {
        rule: usize,
        rule_name: String,
        handler: HandlerKind,
        error: ActionError,
    },
}

impl RuleTable {
    pub fn new(capabilities: SearchCapabilities) -> Self {
        Self {
            rules: Vec::new(),
            capabilities,
        }
    }

    /// Append a rule, compiling its predicate against the table's capabilities.
    pub fn push(&mut self, name: impl Into<String>, predicate: Predicate, handler: Handler) {
        let compiled = compile(&predicate, self.capabilities);
        let name = name.into();
        if !compiled.exact {
            debug!(rule = %name, "search criterion widened; relying on local filter");
        }
        self.rules.push(Rule {
            index: self.rules.len(),
            name,
            predicate,
            compiled,
            handler,
        });
    }

    pub fn with_rule(mut self, name: impl Into<String>, predicate: Predicate, handler: Handler) -> Self {
        self.push(name, predicate, handler);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn capabilities(&self) -> SearchCapabilities {
        self.capabilities
    }

    /// Whether any rule needs the message body for local evaluation.
    pub fn needs_body(&self) -> bool {
        self.rules.iter().any(|r| r.predicate.references(Field::Body))
    }

    /// Whether any rule uses the given handler kind.
    pub fn uses(&self, kind: HandlerKind) -> bool {
        self.rules.iter().any(|r| r.handler.kind() == kind)
    }

    /// The first rule whose candidate set holds the message and whose
    /// predicate accepts it.
    pub fn select(&self, env: &MessageEnvelope, candidates: &Candidates) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| candidates.contains(r.index, env.id) && r.predicate.evaluate(env))
    }

    /// Run the first matching rule's handler. At most one handler executes.
    pub async fn dispatch(
        &self,
        env: &MessageEnvelope,
        candidates: &Candidates,
        ctx: &mut ActionContext<'_>,
    ) -> DispatchOutcome {
        let Some(rule) = self.select(env, candidates) else {
            debug!(uid = %env.id, subject = %env.subject, "no rule matched");
            return DispatchOutcome::NoMatch;
        };

        let kind = rule.handler.kind();
        info!(
            uid = %env.id,
            rule = %rule.name,
            handler = %kind,
            from = %env.sender(),
            "rule matched"
        );

        match rule.handler.execute(env, ctx).await {
            Ok(()) => DispatchOutcome::Succeeded {
                rule: rule.index,
                rule_name: rule.name.clone(),
                handler: kind,
            },
            Err(error) => {
                warn!(
                    uid = %env.id,
                    rule = %rule.name,
                    handler = %kind,
                    transient = error.is_transient(),
                    "handler failed: {error}"
                );
                DispatchOutcome::Failed {
                    rule: rule.index,
                    rule_name: rule.name.clone(),
                    handler: kind,
                    error,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{Handler, HandlerKind};
    use crate::mailbox::{MailboxTransport, MessageId};
    use crate::testing::{MemoryMailbox, RecordingSender, envelope, raw_message};

    fn table() -> RuleTable {
        RuleTable::new(SearchCapabilities::IMAP)
            .with_rule(
                "newsletters",
                Predicate::froms(["@news.test"]),
                Handler::Move {
                    folder: "News".into(),
                },
            )
            .with_rule(
                "catch-all",
                Predicate::AllOf(vec![]),
                Handler::Archive {
                    folder: "Archive".into(),
                },
            )
    }

    #[test]
    fn first_match_wins() {
        let t = table();
        let env = envelope(1, "x@news.test", "me@private.test", "s");
        let rule = t.select(&env, &Candidates::everything()).unwrap();
        assert_eq!(rule.index, 0);
        assert_eq!(rule.name, "newsletters");
    }

    #[test]
    fn later_rule_selected_when_earlier_rejects() {
        let t = table();
        let env = envelope(1, "friend@home.test", "me@private.test", "s");
        assert_eq!(t.select(&env, &Candidates::everything()).unwrap().index, 1);
    }

    #[test]
    fn candidate_set_gates_selection() {
        let t = table();
        let env = envelope(4, "x@news.test", "me@private.test", "s");
        let only_second = Candidates::from_sets(vec![HashSet::new(), HashSet::from([MessageId(4)])]);
        assert_eq!(t.select(&env, &only_second).unwrap().index, 1);
        assert!(only_second.any_contains(MessageId(4)));
        assert!(!only_second.any_contains(MessageId(5)));
    }

    #[test]
    fn local_filter_rejects_widened_candidates() {
        let t = RuleTable::new(SearchCapabilities::CONJUNCTIVE_ONLY).with_rule(
            "either",
            Predicate::froms(["@a.test", "@b.test"]),
            Handler::NoOp,
        );
        assert!(!t.rules()[0].compiled.exact);
        let env = envelope(1, "x@c.test", "me@private.test", "s");
        let widened = Candidates::from_sets(vec![HashSet::from([MessageId(1)])]);
        assert!(t.select(&env, &widened).is_none());
    }

    #[test]
    fn selection_is_idempotent() {
        let t = table();
        let env = envelope(1, "x@news.test", "me@private.test", "s");
        let c = Candidates::everything();
        let first = t.select(&env, &c).map(|r| r.index);
        let second = t.select(&env, &c).map(|r| r.index);
        assert_eq!(first, second);
    }

    #[test]
    fn needs_body_and_uses() {
        let t = table();
        assert!(!t.needs_body());
        assert!(t.uses(HandlerKind::Archive));
        assert!(!t.uses(HandlerKind::ContentProxy));
        let t = t.with_rule("body", Predicate::body("unsubscribe"), Handler::NoOp);
        assert!(t.needs_body());
    }

    #[tokio::test]
    async fn dispatch_runs_only_first_handler() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.add(&raw_message("x@news.test", "me@private.test", "Digest", "hi"));
        let mut session = mailbox.connect().await.unwrap();
        let sender = RecordingSender::new();
        let mut ctx = ActionContext {
            session: session.as_mut(),
            sender: &sender,
            proxy: None,
            sent: None,
        };

        let env = mailbox.envelope(id).unwrap();
        let outcome = table().dispatch(&env, &Candidates::everything(), &mut ctx).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Succeeded { rule: 0, handler: HandlerKind::Move, .. }
        ));
        assert_eq!(mailbox.folder_of(id).as_deref(), Some("News"));
        assert!(!mailbox.is_seen(id));
    }

    #[tokio::test]
    async fn dispatch_surfaces_failures() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.add(&raw_message("x@news.test", "me@private.test", "Digest", "hi"));
        mailbox.fail_move(id);
        let mut session = mailbox.connect().await.unwrap();
        let sender = RecordingSender::new();
        let mut ctx = ActionContext {
            session: session.as_mut(),
            sender: &sender,
            proxy: None,
            sent: None,
        };

        let env = mailbox.envelope(id).unwrap();
        match table().dispatch(&env, &Candidates::everything(), &mut ctx).await {
            DispatchOutcome::Failed { rule, handler, error, .. } => {
                assert_eq!(rule, 0);
                assert_eq!(handler, HandlerKind::Move);
                assert_eq!(error.message_id(), id);
                assert!(error.is_transient());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(mailbox.folder_of(id).as_deref(), Some("INBOX"));
    }

    #[tokio::test]
    async fn unmatched_message_is_untouched() {
        let mailbox = MemoryMailbox::new();
        let id = mailbox.add(&raw_message("x@news.test", "me@private.test", "Digest", "hi"));
        let mut session = mailbox.connect().await.unwrap();
        let sender = RecordingSender::new();
        let mut ctx = ActionContext {
            session: session.as_mut(),
            sender: &sender,
            proxy: None,
            sent: None,
        };
        let t = RuleTable::new(SearchCapabilities::IMAP).with_rule(
            "never",
            Predicate::from("@nowhere.test"),
            Handler::Archive {
                folder: "Archive".into(),
            },
        );

        let env = mailbox.envelope(id).unwrap();
        let outcome = t.dispatch(&env, &Candidates::everything(), &mut ctx).await;
        assert!(matches!(outcome, DispatchOutcome::NoMatch));
        assert!(!mailbox.is_seen(id));
        assert_eq!(mailbox.folder_of(id).as_deref(), Some("INBOX"));
        assert!(sender.sent().is_empty());
    }
}
