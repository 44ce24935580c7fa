use super::types::{
    CandidateDecision, Decision, DecisionStatus, TransitionEvidence, allowed_transition,
};
use crate::audit::{Actor, AuditAction, AuditEvent, Severity, append_tx};
use crate::error::{ArchonError, DecisionError, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::str::FromStr;
use uuid::Uuid;

const DECISION_COLUMNS: &str = "decision_id, agent_id, agent_role, user_id, organization_id,
    request_context, rendered_prompt, response, reasoning, confidence, risk,
    hitl_required, status, rollback_eligible, rollback_data, shadow,
    cost, tokens_used, tags, category, execution_result, execution_error,
    executed_at, rolled_back_at, rolled_back_by, created_at, updated_at";

/// Apply one lifecycle transition inside an open transaction.
///
/// The update is compare-and-set against the status read at the start of the
/// transaction; a concurrent writer makes the update match zero rows and the
/// whole operation is rejected. The audit event commits with the transition
/// or not at all.
pub async fn transition_tx(
    conn: &mut SqliteConnection,
    decision_id: &str,
    new_status: DecisionStatus,
    evidence: &TransitionEvidence,
) -> Result<Decision> {
    let current = fetch_decision(&mut *conn, decision_id)
        .await?
        .ok_or_else(|| {
            ArchonError::Decision(DecisionError::NotFound(decision_id.to_string()))
        })?;

    if !allowed_transition(current.status, new_status) {
        return Err(ArchonError::Decision(DecisionError::InvalidTransition {
            from: current.status.to_string(),
            to: new_status.to_string(),
        }));
    }

    let now = Utc::now();
    let actor = evidence.actor.clone().unwrap_or_else(Actor::system);
    let result_raw = evidence
        .result
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("serialize execution result")?;
    let rollback_raw = evidence
        .rollback_data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("serialize rollback data")?;

    let updated = match new_status {
        DecisionStatus::Executed => {
            sqlx::query(
                "UPDATE decisions
                 SET status = $1, executed_at = $2, execution_result = $3,
                     rollback_data = COALESCE($4, rollback_data),
                     rollback_eligible = CASE WHEN $4 IS NULL THEN rollback_eligible ELSE 1 END,
                     updated_at = $2
                 WHERE decision_id = $5 AND status = $6",
            )
            .bind(new_status.to_string())
            .bind(now.to_rfc3339())
            .bind(&result_raw)
            .bind(&rollback_raw)
            .bind(decision_id)
            .bind(current.status.to_string())
            .execute(&mut *conn)
            .await?
        }
        DecisionStatus::Failed => {
            sqlx::query(
                "UPDATE decisions
                 SET status = $1, execution_error = $2, updated_at = $3
                 WHERE decision_id = $4 AND status = $5",
            )
            .bind(new_status.to_string())
            .bind(&evidence.error)
            .bind(now.to_rfc3339())
            .bind(decision_id)
            .bind(current.status.to_string())
            .execute(&mut *conn)
            .await?
        }
        DecisionStatus::RolledBack => {
            sqlx::query(
                "UPDATE decisions
                 SET status = $1, rolled_back_at = $2, rolled_back_by = $3, updated_at = $2
                 WHERE decision_id = $4 AND status = $5",
            )
            .bind(new_status.to_string())
            .bind(now.to_rfc3339())
            .bind(&actor.id)
            .bind(decision_id)
            .bind(current.status.to_string())
            .execute(&mut *conn)
            .await?
        }
        _ => {
            sqlx::query(
                "UPDATE decisions
                 SET status = $1, updated_at = $2
                 WHERE decision_id = $3 AND status = $4",
            )
            .bind(new_status.to_string())
            .bind(now.to_rfc3339())
            .bind(decision_id)
            .bind(current.status.to_string())
            .execute(&mut *conn)
            .await?
        }
    };

    if updated.rows_affected() == 0 {
        return Err(ArchonError::Decision(DecisionError::Conflict {
            id: decision_id.to_string(),
        }));
    }

    let mut context = serde_json::json!({
        "from": current.status.to_string(),
        "to": new_status.to_string(),
    });
    if let Some(result) = &evidence.result {
        context["result"] = result.clone();
    }
    if let Some(error) = &evidence.error {
        context["error"] = serde_json::Value::String(error.clone());
    }

    let mut event = AuditEvent::new(audit_action_for(new_status), actor)
        .target("decision", decision_id)
        .organization(current.organization_id.clone())
        .context(context);
    event = match new_status {
        DecisionStatus::Failed => {
            event.failed(evidence.error.clone().unwrap_or_else(|| "execution failed".into()))
        }
        DecisionStatus::RolledBack => event.severity(Severity::Warning),
        _ => event,
    };
    append_tx(&mut *conn, &event).await?;

    fetch_decision(&mut *conn, decision_id)
        .await?
        .ok_or_else(|| ArchonError::Decision(DecisionError::NotFound(decision_id.to_string())))
}

fn audit_action_for(status: DecisionStatus) -> AuditAction {
    match status {
        DecisionStatus::Approved => AuditAction::DecisionApproved,
        DecisionStatus::Rejected => AuditAction::DecisionRejected,
        DecisionStatus::Executed => AuditAction::DecisionExecuted,
        DecisionStatus::Failed => AuditAction::DecisionFailed,
        DecisionStatus::RolledBack => AuditAction::DecisionRolledBack,
        DecisionStatus::Pending | DecisionStatus::Shadow => AuditAction::DecisionCreated,
    }
}

async fn fetch_decision(
    conn: &mut SqliteConnection,
    decision_id: &str,
) -> Result<Option<Decision>> {
    let row = sqlx::query(&format!(
        "SELECT {DECISION_COLUMNS} FROM decisions WHERE decision_id = $1"
    ))
    .bind(decision_id)
    .fetch_optional(conn)
    .await
    .context("query decision by id")?;

    row.map(|r| map_decision_row(&r)).transpose()
}

/// SQLite-backed decision store. Decisions are never deleted; terminal states
/// are retained for audit.
pub struct SqliteDecisionStore {
    pool: SqlitePool,
}

impl SqliteDecisionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Access the underlying pool, for components that compose transactions
    /// across stores.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record a proposed action. Shadow candidates land in SHADOW and are
    /// never executed; everything else starts PENDING.
    pub async fn create(&self, candidate: CandidateDecision) -> Result<Decision> {
        let decision_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let status = if candidate.shadow {
            DecisionStatus::Shadow
        } else {
            DecisionStatus::Pending
        };

        let request_context_raw = candidate
            .request_context
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize request context")?;
        let rollback_raw = candidate
            .rollback_data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize rollback data")?;
        let tags_raw = serde_json::to_string(&candidate.tags).context("serialize tags")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO decisions (
                 decision_id, agent_id, agent_role, user_id, organization_id,
                 request_context, rendered_prompt, response, reasoning,
                 confidence, risk, hitl_required, status,
                 rollback_eligible, rollback_data, shadow,
                 cost, tokens_used, tags, category, created_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, $12,
                       $13, $14, $15, $16, $17, $18, $19, $20, $20)",
        )
        .bind(&decision_id)
        .bind(&candidate.agent_id)
        .bind(&candidate.agent_role)
        .bind(&candidate.user_id)
        .bind(&candidate.organization_id)
        .bind(&request_context_raw)
        .bind(&candidate.rendered_prompt)
        .bind(&candidate.response)
        .bind(&candidate.reasoning)
        .bind(candidate.confidence)
        .bind(candidate.risk)
        .bind(status.to_string())
        .bind(i64::from(candidate.rollback_eligible))
        .bind(&rollback_raw)
        .bind(i64::from(candidate.shadow))
        .bind(candidate.cost)
        .bind(i64::try_from(candidate.tokens_used).unwrap_or(i64::MAX))
        .bind(&tags_raw)
        .bind(&candidate.category)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("insert decision")?;

        let event = AuditEvent::new(AuditAction::DecisionCreated, Actor::agent(&candidate.agent_id))
            .target("decision", &decision_id)
            .organization(&candidate.organization_id)
            .context(serde_json::json!({
                "category": candidate.category,
                "confidence": candidate.confidence,
                "risk": candidate.risk,
                "shadow": candidate.shadow,
            }));
        append_tx(&mut tx, &event).await?;

        tx.commit().await?;

        let mut conn = self.pool.acquire().await?;
        fetch_decision(&mut conn, &decision_id)
            .await?
            .ok_or_else(|| ArchonError::Decision(DecisionError::NotFound(decision_id)))
    }

    pub async fn get(&self, decision_id: &str) -> Result<Option<Decision>> {
        let mut conn = self.pool.acquire().await?;
        fetch_decision(&mut conn, decision_id).await
    }

    pub async fn mark_hitl_required(&self, decision_id: &str, required: bool) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE decisions SET hitl_required = $1, updated_at = $2 WHERE decision_id = $3",
        )
        .bind(i64::from(required))
        .bind(Utc::now().to_rfc3339())
        .bind(decision_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ArchonError::Decision(DecisionError::NotFound(
                decision_id.to_string(),
            )));
        }
        Ok(())
    }

    /// Apply one lifecycle transition atomically with its audit event.
    pub async fn transition(
        &self,
        decision_id: &str,
        new_status: DecisionStatus,
        evidence: TransitionEvidence,
    ) -> Result<Decision> {
        let mut tx = self.pool.begin().await?;
        let decision = transition_tx(&mut tx, decision_id, new_status, &evidence).await?;
        tx.commit().await?;
        Ok(decision)
    }

    pub async fn list_by_status(&self, status: DecisionStatus) -> Result<Vec<Decision>> {
        let rows = sqlx::query(&format!(
            "SELECT {DECISION_COLUMNS} FROM decisions
             WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .context("list decisions by status")?;

        rows.iter().map(map_decision_row).collect()
    }

    /// Rolled-back decisions, newest first, optionally scoped to one org.
    pub async fn rollback_history(&self, organization_id: Option<&str>) -> Result<Vec<Decision>> {
        let rows = if let Some(org) = organization_id {
            sqlx::query(&format!(
                "SELECT {DECISION_COLUMNS} FROM decisions
                 WHERE status = 'rolled_back' AND organization_id = $1
                 ORDER BY rolled_back_at DESC"
            ))
            .bind(org)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {DECISION_COLUMNS} FROM decisions
                 WHERE status = 'rolled_back'
                 ORDER BY rolled_back_at DESC"
            ))
            .fetch_all(&self.pool)
            .await?
        };

        rows.iter().map(map_decision_row).collect()
    }
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    Ok(raw
        .map(|value| crate::audit::parse_timestamp(&value))
        .transpose()?)
}

fn map_decision_row(row: &SqliteRow) -> Result<Decision> {
    let status_raw: String = row.try_get("status")?;
    let request_context_raw: Option<String> = row.try_get("request_context")?;
    let rollback_raw: Option<String> = row.try_get("rollback_data")?;
    let result_raw: Option<String> = row.try_get("execution_result")?;
    let tags_raw: String = row.try_get("tags")?;
    let hitl_required: i64 = row.try_get("hitl_required")?;
    let rollback_eligible: i64 = row.try_get("rollback_eligible")?;
    let shadow: i64 = row.try_get("shadow")?;
    let tokens_used: i64 = row.try_get("tokens_used")?;
    let executed_at_raw: Option<String> = row.try_get("executed_at")?;
    let rolled_back_at_raw: Option<String> = row.try_get("rolled_back_at")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let updated_at_raw: String = row.try_get("updated_at")?;

    Ok(Decision {
        decision_id: row.try_get("decision_id")?,
        agent_id: row.try_get("agent_id")?,
        agent_role: row.try_get("agent_role")?,
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        request_context: request_context_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("deserialize request context")?,
        rendered_prompt: row.try_get("rendered_prompt")?,
        response: row.try_get("response")?,
        reasoning: row.try_get("reasoning")?,
        confidence: row.try_get("confidence")?,
        risk: row.try_get("risk")?,
        hitl_required: hitl_required != 0,
        status: DecisionStatus::from_str(&status_raw)
            .with_context(|| format!("unknown decision status: {status_raw}"))?,
        rollback_eligible: rollback_eligible != 0,
        rollback_data: rollback_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("deserialize rollback data")?,
        shadow: shadow != 0,
        cost: row.try_get("cost")?,
        #[allow(clippy::cast_sign_loss)]
        tokens_used: tokens_used as u64,
        tags: serde_json::from_str(&tags_raw).context("deserialize tags")?,
        category: row.try_get("category")?,
        execution_result: result_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("deserialize execution result")?,
        execution_error: row.try_get("execution_error")?,
        executed_at: parse_optional_timestamp(executed_at_raw)?,
        rolled_back_at: parse_optional_timestamp(rolled_back_at_raw)?,
        rolled_back_by: row.try_get("rolled_back_by")?,
        created_at: crate::audit::parse_timestamp(&created_at_raw)?,
        updated_at: crate::audit::parse_timestamp(&updated_at_raw)?,
    })
}
