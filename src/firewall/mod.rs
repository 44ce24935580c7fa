//! Controlled-release firewall: agent-authored documents never leave the
//! system without an explicit, separately recorded approval from their owner,
//! independent of whatever HITL approval the originating decision received.

mod release;
mod types;

pub use release::{RecipientDirectory, ReleaseChannel, ReleaseFirewall};
pub use types::{
    DocumentEvent, DocumentStatus, ExportFormat, ExportRendering, ReleasableDocument,
    ReleaseOutcome,
};
