//! Predicate algebra over message envelope fields.
//!
//! A predicate is a pure value: field matches combined with negation,
//! conjunction and disjunction. Local evaluation is the authoritative
//! semantics; [`super::compile`] only produces a server-side pre-filter.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::mailbox::MessageEnvelope;

/// Envelope field a leaf matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    From,
    To,
    Cc,
    Subject,
    Body,
}

impl Field {
    /// The IMAP SEARCH key for this field.
    pub fn imap_key(self) -> &'static str {
        match self {
            Self::From => "FROM",
            Self::To => "TO",
            Self::Cc => "CC",
            Self::Subject => "SUBJECT",
            Self::Body => "BODY",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::From => "from",
            Self::To => "to",
            Self::Cc => "cc",
            Self::Subject => "subject",
            Self::Body => "body",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Case-insensitive substring match on one field.
    FieldMatch { field: Field, pattern: String },
    Not(Box<Predicate>),
    /// True when every child is true. Empty means "everything".
    AllOf(Vec<Predicate>),
    /// True when any child is true. Empty means "nothing".
    AnyOf(Vec<Predicate>),
}

impl Predicate {
    pub fn field(field: Field, pattern: impl Into<String>) -> Self {
        Self::FieldMatch {
            field,
            pattern: pattern.into(),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from(pattern: impl Into<String>) -> Self {
        Self::field(Field::From, pattern)
    }

    pub fn to(pattern: impl Into<String>) -> Self {
        Self::field(Field::To, pattern)
    }

    pub fn cc(pattern: impl Into<String>) -> Self {
        Self::field(Field::Cc, pattern)
    }

    pub fn subject(pattern: impl Into<String>) -> Self {
        Self::field(Field::Subject, pattern)
    }

    pub fn body(pattern: impl Into<String>) -> Self {
        Self::field(Field::Body, pattern)
    }

    /// Any of several patterns on one field.
    pub fn any_of_field<I, S>(field: Field, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AnyOf(
            patterns
                .into_iter()
                .map(|p| Self::field(field, p))
                .collect(),
        )
    }

    pub fn froms<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self::any_of_field(Field::From, patterns)
    }

    pub fn tos<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self::any_of_field(Field::To, patterns)
    }

    pub fn ccs<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self::any_of_field(Field::Cc, patterns)
    }

    pub fn subjects<I: IntoIterator<Item = S>, S: Into<String>>(patterns: I) -> Self {
        Self::any_of_field(Field::Subject, patterns)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(inner: Predicate) -> Self {
        Self::Not(Box::new(inner))
    }

    /// Evaluate against an envelope.
    ///
    /// A `Body` leaf is false when the body was not loaded.
    pub fn evaluate(&self, env: &MessageEnvelope) -> bool {
        match self {
            Self::FieldMatch { field, pattern } => field_matches(env, *field, pattern),
            Self::Not(inner) => !inner.evaluate(env),
            Self::AllOf(children) => children.iter().all(|p| p.evaluate(env)),
            Self::AnyOf(children) => children.iter().any(|p| p.evaluate(env)),
        }
    }

    /// Whether any leaf in the tree matches on `field`.
    pub fn references(&self, field: Field) -> bool {
        match self {
            Self::FieldMatch { field: f, .. } => *f == field,
            Self::Not(inner) => inner.references(field),
            Self::AllOf(children) | Self::AnyOf(children) => {
                children.iter().any(|p| p.references(field))
            }
        }
    }

    /// Reject patterns that cannot be expressed as an IMAP search string.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::FieldMatch { field, pattern } => {
                if pattern.is_empty() {
                    return Err(format!("empty {field} pattern"));
                }
                if pattern.contains(['\r', '\n']) {
                    return Err(format!("{field} pattern contains a line break"));
                }
                Ok(())
            }
            Self::Not(inner) => inner.validate(),
            Self::AllOf(children) | Self::AnyOf(children) => {
                children.iter().try_for_each(Predicate::validate)
            }
        }
    }
}

/// Case-insensitive substring match against the rendered field values.
pub fn field_matches(env: &MessageEnvelope, field: Field, pattern: &str) -> bool {
    let needle = pattern.to_lowercase();
    let haystack = match field {
        Field::From => join_addresses(&env.from),
        Field::To => join_addresses(&env.to),
        Field::Cc => join_addresses(&env.cc),
        Field::Subject => env.subject.clone(),
        Field::Body => match &env.body {
            Some(body) => body.clone(),
            None => return false,
        },
    };
    haystack.to_lowercase().contains(&needle)
}

fn join_addresses(addrs: &[crate::mailbox::EmailAddress]) -> String {
    addrs
        .iter()
        .map(|a| a.display())
        .collect::<Vec<_>>()
        .join(", ")
}
