use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Work-item queue states.
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
pub enum WorkStatus {
    Pending,
    InProgress,
    Completed,
    ExecutedInternal,
    Failed,
    BlockedMissingHandler,
}

impl WorkStatus {
    /// States the loop picks up each cycle.
    #[must_use]
    pub fn is_runnable(self) -> bool {
        matches!(self, WorkStatus::Pending | WorkStatus::InProgress)
    }

    /// Terminal-with-finality outcomes get a completion timestamp.
    #[must_use]
    pub fn has_finality(self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::ExecutedInternal)
    }
}

/// Status a handler declares for the item it processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerStatus {
    Completed,
    ExecutedInternal,
    Failed,
}

impl From<HandlerStatus> for WorkStatus {
    fn from(status: HandlerStatus) -> Self {
        match status {
            HandlerStatus::Completed => WorkStatus::Completed,
            HandlerStatus::ExecutedInternal => WorkStatus::ExecutedInternal,
            HandlerStatus::Failed => WorkStatus::Failed,
        }
    }
}

/// What a handler hands back: declared status plus updates merged into the
/// item's persisted JSON maps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub status: Option<HandlerStatus>,
    pub detail_updates: Option<serde_json::Map<String, serde_json::Value>>,
    pub metric_updates: Option<serde_json::Map<String, serde_json::Value>>,
    pub notes: Option<String>,
    /// Undo payload captured while executing, stored on the governed decision.
    pub rollback_data: Option<serde_json::Value>,
}

impl HandlerOutcome {
    #[must_use]
    pub fn completed() -> Self {
        Self {
            status: Some(HandlerStatus::Completed),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn executed_internal() -> Self {
        Self {
            status: Some(HandlerStatus::ExecutedInternal),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(notes: impl Into<String>) -> Self {
        Self {
            status: Some(HandlerStatus::Failed),
            notes: Some(notes.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn declared_status(&self) -> HandlerStatus {
        self.status.unwrap_or(HandlerStatus::Completed)
    }

    #[must_use]
    pub fn notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    #[must_use]
    pub fn detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.detail_updates
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn metric(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metric_updates
            .get_or_insert_with(serde_json::Map::new)
            .insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn rollback_data(mut self, data: serde_json::Value) -> Self {
        self.rollback_data = Some(data);
        self
    }
}

/// A unit of queued work bound to an (agent, action type) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub agent_id: String,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub status: WorkStatus,
    pub metrics: serde_json::Value,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkItem {
    /// The governed decision this item executes, when it carries one.
    #[must_use]
    pub fn decision_id(&self) -> Option<&str> {
        self.payload.get("decision_id").and_then(|v| v.as_str())
    }
}
