//! Predicate → mailbox search compilation.
//!
//! The compiled criterion is a server-side pre-filter. It always selects a
//! superset of what the predicate accepts; when the transport cannot express
//! a connective the compiler widens to `ALL` and marks the result inexact.

use serde::{Deserialize, Serialize};

use super::predicate::{Field, Predicate, field_matches};
use crate::mailbox::MessageEnvelope;

/// Connectives the transport's search language supports natively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCapabilities {
    pub or: bool,
    pub not: bool,
}

impl SearchCapabilities {
    /// Full IMAP4rev1 SEARCH: nested OR and NOT.
    pub const IMAP: Self = Self { or: true, not: true };

    /// Juxtaposition (AND) only.
    pub const CONJUNCTIVE_ONLY: Self = Self {
        or: false,
        not: false,
    };
}

impl Default for SearchCapabilities {
    fn default() -> Self {
        Self::IMAP
    }
}

/// Transport-agnostic search query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchCriterion {
    All,
    Nothing,
    Unseen,
    Term { field: Field, pattern: String },
    And(Vec<SearchCriterion>),
    Or(Box<SearchCriterion>, Box<SearchCriterion>),
    Not(Box<SearchCriterion>),
}

impl SearchCriterion {
    /// Render as an IMAP SEARCH key.
    pub fn to_imap(&self) -> String {
        match self {
            Self::All => "ALL".into(),
            Self::Nothing => "NOT ALL".into(),
            Self::Unseen => "UNSEEN".into(),
            Self::Term { field, pattern } => {
                format!("{} {}", field.imap_key(), quote_search(pattern))
            }
            Self::And(parts) => match parts.as_slice() {
                [] => "ALL".into(),
                [only] => only.to_imap(),
                _ => {
                    let inner: Vec<String> = parts.iter().map(Self::to_imap).collect();
                    format!("({})", inner.join(" "))
                }
            },
            Self::Or(a, b) => format!("OR {} {}", a.to_imap(), b.to_imap()),
            Self::Not(inner) => format!("NOT {}", inner.to_imap()),
        }
    }

    /// Evaluate the criterion the way a server would. Used by the in-memory
    /// mailbox and by equivalence checks.
    pub fn matches(&self, env: &MessageEnvelope, seen: bool) -> bool {
        match self {
            Self::All => true,
            Self::Nothing => false,
            Self::Unseen => !seen,
            Self::Term { field, pattern } => field_matches(env, *field, pattern),
            Self::And(parts) => parts.iter().all(|p| p.matches(env, seen)),
            Self::Or(a, b) => a.matches(env, seen) || b.matches(env, seen),
            Self::Not(inner) => !inner.matches(env, seen),
        }
    }

    /// Whether the criterion can never select anything.
    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }
}

fn quote_search(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// A compiled predicate. `exact` means the criterion selects precisely the
/// messages the predicate accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledCriterion {
    pub criterion: SearchCriterion,
    pub exact: bool,
}

impl CompiledCriterion {
    fn exact(criterion: SearchCriterion) -> Self {
        Self {
            criterion,
            exact: true,
        }
    }

    fn widened() -> Self {
        Self {
            criterion: SearchCriterion::All,
            exact: false,
        }
    }
}

/// Compile a predicate for a transport with the given capabilities.
///
/// Pure and total: every predicate compiles, and the same input always
/// yields the same criterion.
pub fn compile(predicate: &Predicate, caps: SearchCapabilities) -> CompiledCriterion {
    match predicate {
        Predicate::FieldMatch { field, pattern } => {
            // Quoted search strings are 7-bit only; the local check covers it.
            if !pattern.is_ascii() {
                return CompiledCriterion::widened();
            }
            let criterion = SearchCriterion::Term {
                field: *field,
                pattern: pattern.clone(),
            };
            // Servers search the raw MIME body, not the decoded text matched
            // locally, so a body term is a pre-filter and never exact.
            CompiledCriterion {
                criterion,
                exact: *field != Field::Body,
            }
        }

        Predicate::AllOf(children) => {
            let compiled: Vec<CompiledCriterion> =
                children.iter().map(|c| compile(c, caps)).collect();
            let exact = compiled.iter().all(|c| c.exact);
            if compiled.iter().any(|c| c.criterion.is_nothing()) {
                return CompiledCriterion {
                    criterion: SearchCriterion::Nothing,
                    exact,
                };
            }
            let mut parts: Vec<SearchCriterion> = compiled
                .into_iter()
                .map(|c| c.criterion)
                .filter(|c| *c != SearchCriterion::All)
                .collect();
            let criterion = match parts.len() {
                0 => SearchCriterion::All,
                1 => parts.remove(0),
                _ => SearchCriterion::And(parts),
            };
            CompiledCriterion { criterion, exact }
        }

        Predicate::AnyOf(children) => {
            if children.is_empty() {
                return CompiledCriterion::exact(SearchCriterion::Nothing);
            }
            let compiled: Vec<CompiledCriterion> =
                children.iter().map(|c| compile(c, caps)).collect();
            let exact = compiled.iter().all(|c| c.exact);
            if compiled.iter().any(|c| c.criterion == SearchCriterion::All) {
                return CompiledCriterion {
                    criterion: SearchCriterion::All,
                    exact,
                };
            }
            let mut parts: Vec<SearchCriterion> = compiled
                .into_iter()
                .map(|c| c.criterion)
                .filter(|c| !c.is_nothing())
                .collect();
            match parts.len() {
                0 => CompiledCriterion {
                    criterion: SearchCriterion::Nothing,
                    exact,
                },
                1 => CompiledCriterion {
                    criterion: parts.remove(0),
                    exact,
                },
                _ if caps.or => {
                    let mut iter = parts.into_iter();
                    let first = iter.next().unwrap_or(SearchCriterion::Nothing);
                    let criterion = iter.fold(first, |acc, next| {
                        SearchCriterion::Or(Box::new(acc), Box::new(next))
                    });
                    CompiledCriterion { criterion, exact }
                }
                _ => CompiledCriterion::widened(),
            }
        }

        Predicate::Not(inner) => {
            let compiled = compile(inner, caps);
            if !caps.not || !compiled.exact {
                return CompiledCriterion::widened();
            }
            let criterion = match compiled.criterion {
                SearchCriterion::All => SearchCriterion::Nothing,
                SearchCriterion::Nothing => SearchCriterion::All,
                other => SearchCriterion::Not(Box::new(other)),
            };
            CompiledCriterion::exact(criterion)
        }
    }
}
