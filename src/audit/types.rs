use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Governance action kinds recorded in the ledger.
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
pub enum AuditAction {
    // Decisions
    DecisionCreated,
    DecisionApproved,
    DecisionRejected,
    DecisionExecuted,
    DecisionFailed,
    DecisionRolledBack,

    // HITL
    HitlRequested,
    HitlNotified,
    HitlApproved,
    HitlRejected,
    HitlExpired,
    HitlEscalated,

    // Controlled-release documents
    DocumentDrafted,
    DocumentApprovalRequested,
    DocumentApproved,
    DocumentRejected,
    DocumentSent,
    DocumentSendFailed,
    DocumentExported,
    DocumentFiledExternal,

    // Dispatch
    DispatchCompleted,
    DispatchFailed,
    DispatchBlocked,
}

/// Who performed a governance action.
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
pub enum ActorKind {
    Human,
    Agent,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub kind: ActorKind,
    pub id: String,
}

impl Actor {
    pub fn human(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Human,
            id: id.into(),
        }
    }

    pub fn agent(id: impl Into<String>) -> Self {
        Self {
            kind: ActorKind::Agent,
            id: id.into(),
        }
    }

    pub fn system() -> Self {
        Self {
            kind: ActorKind::System,
            id: "archon".into(),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

/// Immutable fact about a governance action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub actor: Actor,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub organization_id: Option<String>,
    /// Before/after context, outcomes, trigger sets.
    pub context: Option<serde_json::Value>,
    pub success: bool,
    pub severity: Severity,
    pub error: Option<String>,
}

impl AuditEvent {
    #[must_use]
    pub fn new(action: AuditAction, actor: Actor) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            actor,
            target_type: None,
            target_id: None,
            organization_id: None,
            context: None,
            success: true,
            severity: Severity::Info,
            error: None,
        }
    }

    #[must_use]
    pub fn target(mut self, target_type: impl Into<String>, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.into());
        self.target_id = Some(target_id.into());
        self
    }

    #[must_use]
    pub fn organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    #[must_use]
    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        if self.severity < Severity::Error {
            self.severity = Severity::Error;
        }
        self
    }
}

/// Ledger query filter with stable (timestamp, id) cursor pagination.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub organization_id: Option<String>,
    pub actor_id: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub action: Option<AuditAction>,
    pub severity: Option<Severity>,
    /// Resume after this (timestamp, id) pair from a previous page.
    pub after: Option<(DateTime<Utc>, String)>,
    pub limit: Option<u32>,
}
