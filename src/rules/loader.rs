//! Rule definitions as they appear in the YAML config, and their conversion
//! into a validated [`RuleTable`].

use serde::Deserialize;
use tracing::info;

use super::compile::SearchCapabilities;
use super::predicate::{Field, Predicate};
use super::table::RuleTable;
use crate::error::ConfigError;
use crate::handlers::Handler;
use crate::outbound::parse_mailbox;

/// One `rules:` entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDef {
    pub name: String,
    pub when: PredicateDef,
    pub action: Handler,
}

/// A single pattern or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Patterns {
    One(String),
    Many(Vec<String>),
}

impl Patterns {
    fn into_predicate(self, field: Field) -> Predicate {
        match self {
            Self::One(p) => Predicate::field(field, p),
            Self::Many(ps) => Predicate::any_of_field(field, ps),
        }
    }
}

/// Predicate tree in config form.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum PredicateDef {
    From { pattern: Patterns },
    To { pattern: Patterns },
    Cc { pattern: Patterns },
    Subject { pattern: Patterns },
    Body { pattern: Patterns },
    Not { criterion: Box<PredicateDef> },
    AllOf { criteria: Vec<PredicateDef> },
    AnyOf { criteria: Vec<PredicateDef> },
}

impl PredicateDef {
    pub fn into_predicate(self) -> Predicate {
        match self {
            Self::From { pattern } => pattern.into_predicate(Field::From),
            Self::To { pattern } => pattern.into_predicate(Field::To),
            Self::Cc { pattern } => pattern.into_predicate(Field::Cc),
            Self::Subject { pattern } => pattern.into_predicate(Field::Subject),
            Self::Body { pattern } => pattern.into_predicate(Field::Body),
            Self::Not { criterion } => Predicate::not(criterion.into_predicate()),
            Self::AllOf { criteria } => {
                Predicate::AllOf(criteria.into_iter().map(Self::into_predicate).collect())
            }
            Self::AnyOf { criteria } => {
                Predicate::AnyOf(criteria.into_iter().map(Self::into_predicate).collect())
            }
        }
    }
}

/// Validate every rule and build the table in declaration order.
pub fn build_rule_table(
    defs: &[RuleDef],
    capabilities: SearchCapabilities,
) -> Result<RuleTable, ConfigError> {
    let mut table = RuleTable::new(capabilities);
    for def in defs {
        let predicate = def.when.clone().into_predicate();
        predicate
            .validate()
            .map_err(|reason| ConfigError::MalformedPredicate {
                rule: def.name.clone(),
                reason,
            })?;

        for address in def.action.addresses() {
            parse_mailbox(address).map_err(|e| ConfigError::InvalidValue {
                key: format!("rules.{}.action", def.name),
                message: e.to_string(),
            })?;
        }

        table.push(def.name.clone(), predicate, def.action.clone());
    }
    info!(rules = table.len(), "rule table built");
    Ok(table)
}
