#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::struct_field_names,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use
)]

//! Archon turns an autonomous agent's proposed action into a safely-executed,
//! auditable, reversible operation: HITL gating, a controlled-release
//! firewall for agent-authored documents, an append-only audit ledger, a
//! rollback engine and a background dispatch loop.

pub mod audit;
pub mod config;
pub mod db;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod firewall;
pub mod hitl;
pub mod notify;
#[doc(hidden)]
pub mod observability;
pub mod pipeline;
pub mod rollback;

pub use config::GovernanceConfig;
pub use error::{ArchonError, Result};
pub use pipeline::{GovernancePipeline, Submission};
