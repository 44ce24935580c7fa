//! Reversal of executed decisions through category-keyed strategies. Rollback
//! is total: an unmodeled category falls back to a generic strategy that
//! records the original state without domain side effects.

mod engine;

pub use engine::{
    GenericRollback, RollbackEngine, RollbackOutcome, RollbackReport, RollbackStrategy,
};
