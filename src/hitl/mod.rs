//! Human-in-the-loop gate: decides whether a decision may execute
//! autonomously, and when it may not, manages the review queue through its
//! SLA, escalation and resolution lifecycle.

mod gate;
mod rules;
mod types;

pub use gate::{HitlGate, ReviewerDirectory};
pub use rules::{EvalOutcome, GateRule, RuleSet};
pub use types::{HitlEntry, HitlFilter, HitlStatus, ReviewPriority};
