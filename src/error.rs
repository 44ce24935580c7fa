use thiserror::Error;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for Archon.
///
/// Each subsystem defines its own error variant. Library callers can match on
/// these to decide recovery strategy; internal code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum ArchonError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── Decision lifecycle ──────────────────────────────────────────────
    #[error("decision: {0}")]
    Decision(#[from] DecisionError),

    // ── HITL gate ───────────────────────────────────────────────────────
    #[error("hitl: {0}")]
    Hitl(#[from] HitlError),

    // ── Controlled-release firewall ─────────────────────────────────────
    #[error("firewall: {0}")]
    Firewall(#[from] FirewallError),

    // ── Rollback engine ─────────────────────────────────────────────────
    #[error("rollback: {0}")]
    Rollback(#[from] RollbackError),

    // ── Dispatch loop ───────────────────────────────────────────────────
    #[error("dispatch: {0}")]
    Dispatch(#[from] DispatchError),

    // ── Audit ledger ────────────────────────────────────────────────────
    #[error("audit: {0}")]
    Audit(#[from] AuditError),

    // ── Persistence ─────────────────────────────────────────────────────
    #[error("store: {0}")]
    Store(#[from] StoreError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Decision errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision not found: {0}")]
    NotFound(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("decision {id} was concurrently modified")]
    Conflict { id: String },
}

// ─── HITL errors ────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum HitlError {
    #[error("hitl entry not found: {0}")]
    NotFound(String),

    #[error("decision {decision_id} already has an open review entry")]
    AlreadyOpen { decision_id: String },

    #[error("entry {id} is not open for review (status {status})")]
    NotOpen { id: String, status: String },

    #[error("entry {id} can only be escalated from expired (status {status})")]
    NotExpired { id: String, status: String },

    #[error("entry {id} reached the escalation cap ({cap} hops)")]
    EscalationCapReached { id: String, cap: u32 },
}

// ─── Firewall errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("document not found: {0}")]
    NotFound(String),

    #[error("document {id} is in state {status}, operation requires {expected}")]
    InvalidState {
        id: String,
        status: String,
        expected: String,
    },
}

// ─── Rollback errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("decision not found: {0}")]
    NotFound(String),

    #[error("rollback ineligible: {reason}")]
    Ineligible { reason: String },

    #[error("strategy {category} failed: {message}")]
    StrategyFailed { category: String, message: String },
}

// ─── Dispatch errors ────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("work item {id} was concurrently claimed")]
    Conflict { id: String },
}

// ─── Audit errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("append failed: {0}")]
    Append(String),

    #[error("query failed: {0}")]
    Query(String),
}

// ─── Store errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("schema migration failed: {0}")]
    Migration(String),

    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, ArchonError>;

impl From<sqlx::Error> for ArchonError {
    fn from(err: sqlx::Error) -> Self {
        ArchonError::Store(StoreError::Sqlx(err))
    }
}

impl From<serde_json::Error> for ArchonError {
    fn from(err: serde_json::Error) -> Self {
        ArchonError::Store(StoreError::Encoding(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_displays_edge() {
        let err = ArchonError::Decision(DecisionError::InvalidTransition {
            from: "rejected".into(),
            to: "executed".into(),
        });
        assert!(err.to_string().contains("rejected -> executed"));
    }

    #[test]
    fn hitl_already_open_displays_decision_id() {
        let err = ArchonError::Hitl(HitlError::AlreadyOpen {
            decision_id: "dec-1".into(),
        });
        assert!(err.to_string().contains("dec-1"));
    }

    #[test]
    fn rollback_ineligible_displays_reason() {
        let err = ArchonError::Rollback(RollbackError::Ineligible {
            reason: "no rollback data".into(),
        });
        assert!(err.to_string().contains("no rollback data"));
    }

    #[test]
    fn firewall_invalid_state_displays_expectation() {
        let err = ArchonError::Firewall(FirewallError::InvalidState {
            id: "doc-1".into(),
            status: "sent_to_recipient".into(),
            expected: "draft".into(),
        });
        let text = err.to_string();
        assert!(text.contains("sent_to_recipient"));
        assert!(text.contains("draft"));
    }

    #[test]
    fn anyhow_interop() {
        let anyhow_err = anyhow::anyhow!("something went wrong");
        let err: ArchonError = anyhow_err.into();
        assert!(err.to_string().contains("something went wrong"));
    }
}
