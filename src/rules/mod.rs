//! Classification rules: predicates, their compilation to server-side
//! searches, and the ordered table the engine dispatches through.

pub mod compile;
pub mod loader;
pub mod predicate;
pub mod table;

pub use compile::{CompiledCriterion, SearchCapabilities, SearchCriterion, compile};
pub use loader::{PredicateDef, RuleDef, build_rule_table};
pub use predicate::{Field, Predicate};
pub use table::{Candidates, DispatchOutcome, Rule, RuleTable};
