use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Firewall states of a releasable document.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    SentToRecipient,
    Exported,
    FiledExternal,
    Failed,
}

impl DocumentStatus {
    /// States from which `approve_and_release` may proceed. DRAFT is
    /// tolerated so an owner approving before the request step completed is
    /// not rejected; APPROVED and FAILED allow retries.
    #[must_use]
    pub fn releasable(self) -> bool {
        matches!(
            self,
            DocumentStatus::Draft
                | DocumentStatus::PendingApproval
                | DocumentStatus::Approved
                | DocumentStatus::Failed
        )
    }

    /// Past the owner-approval barrier.
    #[must_use]
    pub fn post_approval(self) -> bool {
        matches!(
            self,
            DocumentStatus::Approved
                | DocumentStatus::SentToRecipient
                | DocumentStatus::Exported
                | DocumentStatus::FiledExternal
                | DocumentStatus::Failed
        )
    }
}

/// One entry in a document's own ordered event list, kept alongside the
/// global ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub status: DocumentStatus,
    pub actor: Option<String>,
    pub detail: Option<serde_json::Value>,
}

/// An agent-authored artifact intended for an external recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleasableDocument {
    pub document_id: String,
    pub owner_id: String,
    pub agent_id: String,
    pub doc_type: String,
    pub payload: serde_json::Value,
    pub status: DocumentStatus,
    pub recipient: Option<String>,
    pub events: Vec<DocumentEvent>,
    pub created_at: DateTime<Utc>,
    pub approval_requested_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub exported_at: Option<DateTime<Utc>>,
    pub filed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Rendering formats for compliance export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct ExportRendering {
    pub format: ExportFormat,
    pub content: String,
    pub document: ReleasableDocument,
}

/// Outcome of `approve_and_release`. Missing recipient and unavailable
/// channel are actionable conditions, not failures.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Transmitted and recorded SENT_TO_RECIPIENT.
    Sent(ReleasableDocument),
    /// Already sent earlier; nothing was re-transmitted.
    AlreadySent(ReleasableDocument),
    /// No recipient address known; caller should prompt for one.
    MissingRecipient { document_id: String },
    /// Approval recorded but no release channel is configured; retry once
    /// one is available.
    ChannelUnavailable(ReleasableDocument),
    /// Transmission failed; the document is FAILED and the operation may be
    /// retried.
    Failed {
        document: ReleasableDocument,
        error: String,
    },
}

impl ReleaseOutcome {
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, ReleaseOutcome::Sent(_) | ReleaseOutcome::AlreadySent(_))
    }
}
