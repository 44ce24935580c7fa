use super::types::{Actor, ActorKind, AuditAction, AuditEvent, AuditQuery, Severity};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::str::FromStr;

const DEFAULT_PAGE_SIZE: u32 = 100;

/// Append an event inside an open transaction.
///
/// State transitions and their audit events must commit together; callers that
/// mutate an entity pass their transaction connection here so a failed append
/// rolls the transition back with it.
pub async fn append_tx(conn: &mut SqliteConnection, event: &AuditEvent) -> Result<()> {
    let context_raw = event
        .context
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .context("serialize audit context")?;

    sqlx::query(
        "INSERT INTO audit_log (
             id, timestamp, action, actor_kind, actor_id,
             target_type, target_id, organization_id, context,
             success, severity, error
         ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
    )
    .bind(&event.id)
    .bind(event.timestamp.to_rfc3339())
    .bind(event.action.to_string())
    .bind(event.actor.kind.to_string())
    .bind(&event.actor.id)
    .bind(&event.target_type)
    .bind(&event.target_id)
    .bind(&event.organization_id)
    .bind(context_raw)
    .bind(i64::from(event.success))
    .bind(event.severity.to_string())
    .bind(&event.error)
    .execute(conn)
    .await
    .context("append audit event")?;

    Ok(())
}

/// SQLite-backed ledger. Append and query are the entire surface; there is no
/// update or delete operation.
pub struct SqliteAuditLedger {
    pool: SqlitePool,
}

impl SqliteAuditLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Append a single event outside any caller transaction.
    pub async fn append(&self, event: AuditEvent) -> Result<AuditEvent> {
        let mut conn = self.pool.acquire().await?;
        append_tx(&mut conn, &event).await?;
        Ok(event)
    }

    /// Filtered query, ordered by (timestamp, id) ascending for stable pages.
    pub async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let mut sql = String::from(
            "SELECT id, timestamp, action, actor_kind, actor_id,
                    target_type, target_id, organization_id, context,
                    success, severity, error
             FROM audit_log
             WHERE 1 = 1",
        );
        let mut binds: Vec<String> = Vec::new();

        if let Some(org) = &query.organization_id {
            sql.push_str(" AND organization_id = ?");
            binds.push(org.clone());
        }
        if let Some(actor_id) = &query.actor_id {
            sql.push_str(" AND actor_id = ?");
            binds.push(actor_id.clone());
        }
        if let Some(target_type) = &query.target_type {
            sql.push_str(" AND target_type = ?");
            binds.push(target_type.clone());
        }
        if let Some(target_id) = &query.target_id {
            sql.push_str(" AND target_id = ?");
            binds.push(target_id.clone());
        }
        if let Some(action) = query.action {
            sql.push_str(" AND action = ?");
            binds.push(action.to_string());
        }
        if let Some(severity) = query.severity {
            sql.push_str(" AND severity = ?");
            binds.push(severity.to_string());
        }
        if let Some((after_ts, after_id)) = &query.after {
            sql.push_str(" AND (timestamp > ? OR (timestamp = ? AND id > ?))");
            let ts = after_ts.to_rfc3339();
            binds.push(ts.clone());
            binds.push(ts);
            binds.push(after_id.clone());
        }

        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT ?");
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);

        let mut stmt = sqlx::query(&sql);
        for bind in &binds {
            stmt = stmt.bind(bind);
        }
        stmt = stmt.bind(i64::from(limit));

        let rows = stmt
            .fetch_all(&self.pool)
            .await
            .context("query audit ledger")?;

        rows.iter().map(map_event_row).collect()
    }

    /// Full ordered trail for one target.
    pub async fn history(&self, target_type: &str, target_id: &str) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query(
            "SELECT id, timestamp, action, actor_kind, actor_id,
                    target_type, target_id, organization_id, context,
                    success, severity, error
             FROM audit_log
             WHERE target_type = $1 AND target_id = $2
             ORDER BY timestamp ASC, id ASC",
        )
        .bind(target_type)
        .bind(target_id)
        .fetch_all(&self.pool)
        .await
        .context("query audit history")?;

        rows.iter().map(map_event_row).collect()
    }

    /// Total event count, mainly for invariant checks.
    pub async fn count(&self) -> Result<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&self.pool)
            .await?;
        u64::try_from(row.0).context("convert audit count")
    }
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {raw}"))
}

fn map_event_row(row: &SqliteRow) -> Result<AuditEvent> {
    let timestamp_raw: String = row.try_get("timestamp")?;
    let action_raw: String = row.try_get("action")?;
    let actor_kind_raw: String = row.try_get("actor_kind")?;
    let severity_raw: String = row.try_get("severity")?;
    let context_raw: Option<String> = row.try_get("context")?;
    let success: i64 = row.try_get("success")?;

    Ok(AuditEvent {
        id: row.try_get("id")?,
        timestamp: parse_timestamp(&timestamp_raw)?,
        action: AuditAction::from_str(&action_raw)
            .with_context(|| format!("unknown audit action: {action_raw}"))?,
        actor: Actor {
            kind: ActorKind::from_str(&actor_kind_raw)
                .with_context(|| format!("unknown actor kind: {actor_kind_raw}"))?,
            id: row.try_get("actor_id")?,
        },
        target_type: row.try_get("target_type")?,
        target_id: row.try_get("target_id")?,
        organization_id: row.try_get("organization_id")?,
        context: context_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("deserialize audit context")?,
        success: success != 0,
        severity: Severity::from_str(&severity_raw)
            .with_context(|| format!("unknown severity: {severity_raw}"))?,
        error: row.try_get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn ledger() -> SqliteAuditLedger {
        let pool = db::connect_in_memory().await.unwrap();
        SqliteAuditLedger::new(pool)
    }

    fn event(action: AuditAction, target_id: &str) -> AuditEvent {
        AuditEvent::new(action, Actor::agent("perseo"))
            .target("decision", target_id)
            .organization("org-1")
    }

    #[tokio::test]
    async fn append_then_read_back_preserves_order_and_count() {
        let ledger = ledger().await;
        for idx in 0..5 {
            ledger
                .append(event(AuditAction::DecisionCreated, &format!("dec-{idx}")))
                .await
                .unwrap();
        }

        let events = ledger.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(events.len(), 5);
        let ids: Vec<_> = events
            .iter()
            .map(|e| e.target_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["dec-0", "dec-1", "dec-2", "dec-3", "dec-4"]);
        assert_eq!(ledger.count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn query_filters_by_action_and_severity() {
        let ledger = ledger().await;
        ledger
            .append(event(AuditAction::DecisionCreated, "dec-1"))
            .await
            .unwrap();
        ledger
            .append(
                event(AuditAction::DecisionRolledBack, "dec-1").severity(Severity::Warning),
            )
            .await
            .unwrap();

        let rolled_back = ledger
            .query(&AuditQuery {
                action: Some(AuditAction::DecisionRolledBack),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rolled_back.len(), 1);

        let warnings = ledger
            .query(&AuditQuery {
                severity: Some(Severity::Warning),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].action, AuditAction::DecisionRolledBack);
    }

    #[tokio::test]
    async fn pagination_cursor_resumes_without_overlap() {
        let ledger = ledger().await;
        for idx in 0..7 {
            ledger
                .append(event(AuditAction::DecisionCreated, &format!("dec-{idx}")))
                .await
                .unwrap();
        }

        let first_page = ledger
            .query(&AuditQuery {
                limit: Some(3),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(first_page.len(), 3);

        let last = first_page.last().unwrap();
        let second_page = ledger
            .query(&AuditQuery {
                limit: Some(10),
                after: Some((last.timestamp, last.id.clone())),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(second_page.len(), 4);
        assert!(second_page.iter().all(|e| !first_page
            .iter()
            .any(|f| f.id == e.id)));
    }

    #[tokio::test]
    async fn history_returns_full_target_trail_in_order() {
        let ledger = ledger().await;
        ledger
            .append(event(AuditAction::DecisionCreated, "dec-1"))
            .await
            .unwrap();
        ledger
            .append(event(AuditAction::DecisionApproved, "dec-1"))
            .await
            .unwrap();
        ledger
            .append(event(AuditAction::DecisionExecuted, "dec-2"))
            .await
            .unwrap();

        let trail = ledger.history("decision", "dec-1").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].action, AuditAction::DecisionCreated);
        assert_eq!(trail[1].action, AuditAction::DecisionApproved);
    }

    #[tokio::test]
    async fn context_round_trips_as_json() {
        let ledger = ledger().await;
        ledger
            .append(
                event(AuditAction::HitlRequested, "dec-1")
                    .context(serde_json::json!({"triggers": ["low_confidence"]})),
            )
            .await
            .unwrap();

        let events = ledger.query(&AuditQuery::default()).await.unwrap();
        assert_eq!(
            events[0].context.as_ref().unwrap()["triggers"][0],
            "low_confidence"
        );
    }
}
