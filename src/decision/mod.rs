//! Candidate decision records and their lifecycle state machine. Every
//! transition is compare-and-set against the current status and commits in
//! the same transaction as its audit event.

mod store;
mod types;

pub use store::{SqliteDecisionStore, transition_tx};
pub use types::{
    CandidateDecision, Decision, DecisionStatus, TransitionEvidence, allowed_transition,
};
