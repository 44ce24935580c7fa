use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Review-queue lifecycle states.
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
pub enum HitlStatus {
    Pending,
    Notified,
    InReview,
    Approved,
    Rejected,
    Expired,
    Escalated,
}

impl HitlStatus {
    /// Open entries accept human action. Escalated is a transient state on
    /// the way back to Notified and is not directly actionable.
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(
            self,
            HitlStatus::Pending | HitlStatus::Notified | HitlStatus::InReview
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, HitlStatus::Approved | HitlStatus::Rejected)
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
pub enum ReviewPriority {
    Low,
    Medium,
    High,
    Critical,
}

impl ReviewPriority {
    /// One step up; escalation raises priority until Critical.
    #[must_use]
    pub fn bumped(self) -> Self {
        match self {
            ReviewPriority::Low => ReviewPriority::Medium,
            ReviewPriority::Medium => ReviewPriority::High,
            ReviewPriority::High | ReviewPriority::Critical => ReviewPriority::Critical,
        }
    }

    /// Priority derived from the agent's risk estimate.
    #[must_use]
    pub fn from_risk(risk: f64) -> Self {
        if risk >= 0.8 {
            ReviewPriority::Critical
        } else if risk >= 0.6 {
            ReviewPriority::High
        } else if risk >= 0.3 {
            ReviewPriority::Medium
        } else {
            ReviewPriority::Low
        }
    }
}

/// A queued human-review request, one-to-one with a flagged decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlEntry {
    pub id: String,
    pub decision_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub organization_id: String,
    pub summary: String,
    pub recommendation: Option<String>,
    pub confidence: f64,
    pub risk: f64,
    pub reason: String,
    /// Full set of rule ids that fired, not just the first.
    pub triggers: Vec<String>,
    pub status: HitlStatus,
    pub priority: ReviewPriority,
    /// Fixed at creation; never extended by resolution attempts.
    pub sla_deadline: DateTime<Utc>,
    pub is_overdue: bool,
    pub assigned_to: Option<String>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub assigned_by: Option<String>,
    pub reviewed_by: Option<String>,
    pub review_decision: Option<String>,
    pub review_notes: Option<String>,
    /// Human-supplied modification to the proposed action, if any.
    pub modifications: Option<serde_json::Value>,
    pub notification_attempts: u32,
    pub notified_at: Option<DateTime<Utc>>,
    pub escalated_to: Option<String>,
    pub escalation_reason: Option<String>,
    pub escalation_hops: u32,
    pub created_at: DateTime<Utc>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Listing filter for open entries.
#[derive(Debug, Clone, Default)]
pub struct HitlFilter {
    pub organization_id: Option<String>,
    pub assigned_to: Option<String>,
    pub priority: Option<ReviewPriority>,
}
