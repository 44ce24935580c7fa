//! Append-only audit ledger: the system of record for what happened and who
//! allowed it. Events are written once and never updated or deleted; queries
//! are the only read path.

mod ledger;
mod types;

pub use ledger::{SqliteAuditLedger, append_tx};
pub(crate) use ledger::parse_timestamp;
pub use types::{
    Actor, ActorKind, AuditAction, AuditEvent, AuditQuery, Severity,
};
