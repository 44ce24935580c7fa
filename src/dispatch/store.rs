use super::types::{HandlerOutcome, WorkItem, WorkStatus};
use crate::error::{ArchonError, DispatchError, Result};
use anyhow::Context;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::str::FromStr;
use uuid::Uuid;

const WORK_COLUMNS: &str =
    "id, agent_id, action_type, payload, status, metrics, notes, created_at, updated_at, completed_at";

/// Enqueue a work item inside an open transaction, so creators (HITL
/// approval, document approval) commit the item with their own state change.
pub async fn enqueue_tx(
    conn: &mut SqliteConnection,
    agent_id: &str,
    action_type: &str,
    payload: serde_json::Value,
) -> Result<WorkItem> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let payload_raw = serde_json::to_string(&payload).context("serialize work payload")?;

    sqlx::query(
        "INSERT INTO work_items (id, agent_id, action_type, payload, status, metrics, created_at, updated_at)
         VALUES ($1, $2, $3, $4, 'pending', '{}', $5, $5)",
    )
    .bind(&id)
    .bind(agent_id)
    .bind(action_type)
    .bind(&payload_raw)
    .bind(now.to_rfc3339())
    .execute(conn)
    .await
    .context("insert work item")?;

    Ok(WorkItem {
        id,
        agent_id: agent_id.to_string(),
        action_type: action_type.to_string(),
        payload,
        status: WorkStatus::Pending,
        metrics: serde_json::json!({}),
        notes: None,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
}

/// SQLite-backed work queue. Terminal items are never mutated; retry means a
/// new item.
pub struct SqliteWorkQueue {
    pool: SqlitePool,
}

impl SqliteWorkQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn enqueue(
        &self,
        agent_id: &str,
        action_type: &str,
        payload: serde_json::Value,
    ) -> Result<WorkItem> {
        let mut conn = self.pool.acquire().await?;
        enqueue_tx(&mut conn, agent_id, action_type, payload).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<WorkItem>> {
        let row = sqlx::query(&format!(
            "SELECT {WORK_COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("query work item")?;

        row.map(|r| map_work_row(&r)).transpose()
    }

    /// Items the loop should process this cycle, oldest first.
    pub async fn fetch_runnable(&self) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORK_COLUMNS} FROM work_items
             WHERE status IN ('pending', 'in_progress')
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("fetch runnable work items")?;

        rows.iter().map(map_work_row).collect()
    }

    /// Park an item with no registered handler. Compare-and-set from the
    /// runnable states; a concurrent writer wins and this returns Conflict.
    pub async fn mark_blocked(&self, id: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE work_items
             SET status = 'blocked_missing_handler', updated_at = $1,
                 notes = COALESCE(notes, 'no handler registered for (agent, action)')
             WHERE id = $2 AND status IN ('pending', 'in_progress')",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ArchonError::Dispatch(DispatchError::Conflict {
                id: id.to_string(),
            }));
        }
        Ok(())
    }

    /// Apply a handler outcome: status from the declared outcome, JSON maps
    /// merged, completion timestamp only for outcomes with finality.
    pub async fn apply_outcome(&self, item: &WorkItem, outcome: &HandlerOutcome) -> Result<WorkItem> {
        let new_status: WorkStatus = outcome.declared_status().into();
        let now = Utc::now();

        let mut payload = item.payload.clone();
        if let (Some(map), Some(updates)) = (payload.as_object_mut(), &outcome.detail_updates) {
            for (key, value) in updates {
                map.insert(key.clone(), value.clone());
            }
        }
        let mut metrics = item.metrics.clone();
        if let (Some(map), Some(updates)) = (metrics.as_object_mut(), &outcome.metric_updates) {
            for (key, value) in updates {
                map.insert(key.clone(), value.clone());
            }
        }

        let completed_at = new_status.has_finality().then(|| now.to_rfc3339());

        let updated = sqlx::query(
            "UPDATE work_items
             SET status = $1, payload = $2, metrics = $3,
                 notes = COALESCE($4, notes),
                 completed_at = COALESCE($5, completed_at),
                 updated_at = $6
             WHERE id = $7 AND status IN ('pending', 'in_progress')",
        )
        .bind(new_status.to_string())
        .bind(serde_json::to_string(&payload).context("serialize payload")?)
        .bind(serde_json::to_string(&metrics).context("serialize metrics")?)
        .bind(&outcome.notes)
        .bind(&completed_at)
        .bind(now.to_rfc3339())
        .bind(&item.id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(ArchonError::Dispatch(DispatchError::Conflict {
                id: item.id.clone(),
            }));
        }

        self.get(&item.id).await?.ok_or_else(|| {
            ArchonError::Dispatch(DispatchError::NotFound(item.id.clone()))
        })
    }
}

fn map_work_row(row: &SqliteRow) -> Result<WorkItem> {
    let status_raw: String = row.try_get("status")?;
    let payload_raw: String = row.try_get("payload")?;
    let metrics_raw: String = row.try_get("metrics")?;
    let created_at_raw: String = row.try_get("created_at")?;
    let updated_at_raw: String = row.try_get("updated_at")?;
    let completed_at_raw: Option<String> = row.try_get("completed_at")?;

    Ok(WorkItem {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        action_type: row.try_get("action_type")?,
        payload: serde_json::from_str(&payload_raw).context("deserialize work payload")?,
        status: WorkStatus::from_str(&status_raw)
            .with_context(|| format!("unknown work status: {status_raw}"))?,
        metrics: serde_json::from_str(&metrics_raw).context("deserialize work metrics")?,
        notes: row.try_get("notes")?,
        created_at: crate::audit::parse_timestamp(&created_at_raw)?,
        updated_at: crate::audit::parse_timestamp(&updated_at_raw)?,
        completed_at: completed_at_raw
            .map(|raw| crate::audit::parse_timestamp(&raw))
            .transpose()?,
    })
}
