use crate::audit::Actor;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle states of a proposed agent action.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
    RolledBack,
    Shadow,
}

/// The transition graph. Anything not listed here is rejected; shadow and
/// terminal states permit nothing further.
#[must_use]
pub fn allowed_transition(from: DecisionStatus, to: DecisionStatus) -> bool {
    use DecisionStatus::{Approved, Executed, Failed, Pending, Rejected, RolledBack};
    matches!(
        (from, to),
        (Pending, Approved | Rejected | Executed | Failed)
            | (Approved, Executed | Failed)
            | (Executed, RolledBack)
    )
}

impl DecisionStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DecisionStatus::Rejected | DecisionStatus::RolledBack | DecisionStatus::Failed
        )
    }
}

/// Payload handed over by the reasoning producer when proposing an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateDecision {
    pub agent_id: String,
    pub agent_role: Option<String>,
    pub user_id: String,
    pub organization_id: String,
    pub request_context: Option<serde_json::Value>,
    pub rendered_prompt: Option<String>,
    pub response: String,
    pub reasoning: Option<String>,
    /// Confidence and risk estimates in [0, 1].
    pub confidence: f64,
    pub risk: f64,
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub rollback_eligible: bool,
    #[serde(default)]
    pub rollback_data: Option<serde_json::Value>,
    #[serde(default)]
    pub shadow: bool,
}

/// A proposed agent action with full lifecycle metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub agent_id: String,
    pub agent_role: Option<String>,
    pub user_id: String,
    pub organization_id: String,
    pub request_context: Option<serde_json::Value>,
    pub rendered_prompt: Option<String>,
    pub response: String,
    pub reasoning: Option<String>,
    pub confidence: f64,
    pub risk: f64,
    pub hitl_required: bool,
    pub status: DecisionStatus,
    pub rollback_eligible: bool,
    pub rollback_data: Option<serde_json::Value>,
    pub shadow: bool,
    pub cost: f64,
    pub tokens_used: u64,
    pub tags: Vec<String>,
    pub category: String,
    pub execution_result: Option<serde_json::Value>,
    pub execution_error: Option<String>,
    pub executed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub rolled_back_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Who drove a transition and what it produced. Lands in the audit event's
/// context and, for executions, in the decision's result columns.
#[derive(Debug, Clone, Default)]
pub struct TransitionEvidence {
    pub actor: Option<Actor>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// Rollback payload captured by the executing handler.
    pub rollback_data: Option<serde_json::Value>,
}

impl TransitionEvidence {
    #[must_use]
    pub fn by(actor: Actor) -> Self {
        Self {
            actor: Some(actor),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    #[must_use]
    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    #[must_use]
    pub fn rollback_data(mut self, data: serde_json::Value) -> Self {
        self.rollback_data = Some(data);
        self
    }
}
