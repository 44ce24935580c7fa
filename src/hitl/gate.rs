use super::rules::{EvalOutcome, RuleSet};
use super::types::{HitlEntry, HitlFilter, HitlStatus, ReviewPriority};
use crate::audit::{Actor, AuditAction, AuditEvent, Severity, append_tx};
use crate::config::HitlConfig;
use crate::decision::{Decision, DecisionStatus, TransitionEvidence, transition_tx};
use crate::dispatch::{WorkItem, enqueue_tx};
use crate::error::{ArchonError, HitlError, Result};
use crate::notify::NotificationChannel;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::str::FromStr;
use std::sync::Arc;

const ENTRY_COLUMNS: &str = "id, decision_id, agent_id, user_id, organization_id, summary,
    recommendation, confidence, risk, reason, triggers, status, priority,
    sla_deadline, is_overdue, assigned_to, assigned_at, assigned_by,
    reviewed_by, review_decision, review_notes, modifications,
    notification_attempts, notified_at, escalated_to, escalation_reason,
    escalation_hops, created_at, reviewed_at, resolved_at";

/// Best-effort reviewer lookup for auto-assignment. Absence of an eligible
/// reviewer is not an error.
#[async_trait]
pub trait ReviewerDirectory: Send + Sync {
    async fn reviewer_for(&self, organization_id: &str) -> Option<String>;
}

/// Resolution of a review: the terminal entry, the transitioned decision, and
/// the execution work item when the review approved it.
#[derive(Debug)]
pub struct ReviewResolution {
    pub entry: HitlEntry,
    pub decision: Decision,
    pub work_item: Option<WorkItem>,
}

/// Decides whether a decision may execute autonomously and manages the
/// human-review lifecycle when it may not.
pub struct HitlGate {
    pool: SqlitePool,
    config: HitlConfig,
    rules: RuleSet,
    notifier: Arc<dyn NotificationChannel>,
    reviewers: Option<Arc<dyn ReviewerDirectory>>,
}

impl HitlGate {
    pub fn new(
        pool: SqlitePool,
        config: HitlConfig,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            pool,
            config,
            rules: RuleSet::standard(),
            notifier,
            reviewers: None,
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    #[must_use]
    pub fn with_reviewer_directory(mut self, reviewers: Arc<dyn ReviewerDirectory>) -> Self {
        self.reviewers = Some(reviewers);
        self
    }

    pub fn config(&self) -> &HitlConfig {
        &self.config
    }

    /// Run the ordered rule list. Pure; no state is touched.
    #[must_use]
    pub fn evaluate(&self, decision: &Decision) -> EvalOutcome {
        self.rules.evaluate(decision, &self.config)
    }

    /// Queue a decision for human review. Exactly one open entry may exist
    /// per decision; the notification step is fire-and-forget.
    pub async fn request_review(
        &self,
        decision: &Decision,
        reason: &str,
        triggers: &[String],
        priority: ReviewPriority,
        sla_minutes: i64,
    ) -> Result<HitlEntry> {
        let existing: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM hitl_queue
             WHERE decision_id = $1
               AND status IN ('pending', 'notified', 'in_review', 'escalated')",
        )
        .bind(&decision.decision_id)
        .fetch_optional(&self.pool)
        .await
        .context("check for open review entry")?;
        if existing.is_some() {
            return Err(ArchonError::Hitl(HitlError::AlreadyOpen {
                decision_id: decision.decision_id.clone(),
            }));
        }

        let assignee = match &self.reviewers {
            Some(directory) => directory.reviewer_for(&decision.organization_id).await,
            None => None,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let sla_deadline = now + Duration::minutes(sla_minutes);
        let triggers_raw = serde_json::to_string(triggers).context("serialize triggers")?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO hitl_queue (
                 id, decision_id, agent_id, user_id, organization_id, summary,
                 recommendation, confidence, risk, reason, triggers,
                 status, priority, sla_deadline,
                 assigned_to, assigned_at, assigned_by, created_at
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                       'pending', $12, $13, $14, $15, $16, $17)",
        )
        .bind(&id)
        .bind(&decision.decision_id)
        .bind(&decision.agent_id)
        .bind(&decision.user_id)
        .bind(&decision.organization_id)
        .bind(summarize(decision))
        .bind(&decision.response)
        .bind(decision.confidence)
        .bind(decision.risk)
        .bind(reason)
        .bind(&triggers_raw)
        .bind(priority.to_string())
        .bind(sla_deadline.to_rfc3339())
        .bind(&assignee)
        .bind(assignee.as_ref().map(|_| now.to_rfc3339()))
        .bind(assignee.as_ref().map(|_| "auto_assign".to_string()))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("insert hitl entry")?;

        sqlx::query(
            "UPDATE decisions SET hitl_required = 1, updated_at = $1 WHERE decision_id = $2",
        )
        .bind(now.to_rfc3339())
        .bind(&decision.decision_id)
        .execute(&mut *tx)
        .await
        .context("flag decision hitl_required")?;

        let severity = if priority >= ReviewPriority::High {
            Severity::Warning
        } else {
            Severity::Info
        };
        let event = AuditEvent::new(AuditAction::HitlRequested, Actor::agent(&decision.agent_id))
            .target("decision", &decision.decision_id)
            .organization(&decision.organization_id)
            .severity(severity)
            .context(serde_json::json!({
                "reason": reason,
                "triggers": triggers,
                "priority": priority.to_string(),
                "sla_deadline": sla_deadline.to_rfc3339(),
            }));
        append_tx(&mut tx, &event).await?;

        tx.commit().await?;

        self.notify_entry(&id).await;

        self.get(&id).await?.ok_or_else(|| {
            ArchonError::Hitl(HitlError::NotFound(id))
        })
    }

    /// Deliver (or attempt) the review notification, then mark the entry
    /// notified. Delivery failure is logged and never blocks state.
    async fn notify_entry(&self, entry_id: &str) {
        let Ok(Some(entry)) = self.get(entry_id).await else {
            return;
        };

        let recipient = entry
            .assigned_to
            .clone()
            .unwrap_or_else(|| format!("org:{}", entry.organization_id));

        if let Err(error) = self
            .notifier
            .notify(&recipient, &entry.decision_id, &entry.summary)
            .await
        {
            tracing::warn!(
                entry = %entry.id,
                recipient = %recipient,
                error = %error,
                "review notification delivery failed"
            );
        }

        let result = async {
            let mut tx = self.pool.begin().await?;
            let now = Utc::now();
            let updated = sqlx::query(
                "UPDATE hitl_queue
                 SET status = 'notified',
                     notification_attempts = notification_attempts + 1,
                     notified_at = $1
                 WHERE id = $2 AND status IN ('pending', 'escalated')",
            )
            .bind(now.to_rfc3339())
            .bind(&entry.id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() > 0 {
                let event = AuditEvent::new(AuditAction::HitlNotified, Actor::system())
                    .target("decision", &entry.decision_id)
                    .organization(&entry.organization_id)
                    .context(serde_json::json!({"recipient": recipient}));
                append_tx(&mut tx, &event).await?;
            }
            tx.commit().await?;
            Ok::<(), ArchonError>(())
        }
        .await;

        if let Err(error) = result {
            tracing::warn!(entry = %entry.id, error = %error, "failed to mark entry notified");
        }
    }

    /// Claim an entry for review: NOTIFIED or PENDING becomes IN_REVIEW.
    pub async fn start_review(&self, entry_id: &str, reviewer: &str) -> Result<HitlEntry> {
        let updated = sqlx::query(
            "UPDATE hitl_queue
             SET status = 'in_review',
                 assigned_to = COALESCE(assigned_to, $1)
             WHERE id = $2 AND status IN ('pending', 'notified')",
        )
        .bind(reviewer)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let entry = self.require(entry_id).await?;
            return Err(ArchonError::Hitl(HitlError::NotOpen {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            }));
        }
        self.require(entry_id).await
    }

    /// Approve: entry and decision move together or not at all, and the
    /// execution work item is queued in the same transaction.
    pub async fn approve(
        &self,
        entry_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        modifications: Option<serde_json::Value>,
    ) -> Result<ReviewResolution> {
        self.resolve(entry_id, reviewer, notes, modifications, true).await
    }

    /// Reject: a normal terminal outcome, not an error.
    pub async fn reject(
        &self,
        entry_id: &str,
        reviewer: &str,
        notes: &str,
    ) -> Result<ReviewResolution> {
        self.resolve(entry_id, reviewer, Some(notes), None, false).await
    }

    async fn resolve(
        &self,
        entry_id: &str,
        reviewer: &str,
        notes: Option<&str>,
        modifications: Option<serde_json::Value>,
        approve: bool,
    ) -> Result<ReviewResolution> {
        let mut tx = self.pool.begin().await?;

        let entry = fetch_entry(&mut tx, entry_id)
            .await?
            .ok_or_else(|| ArchonError::Hitl(HitlError::NotFound(entry_id.to_string())))?;
        if !entry.status.is_open() {
            return Err(ArchonError::Hitl(HitlError::NotOpen {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            }));
        }

        let now = Utc::now();
        let (new_status, review_decision) = if approve {
            (HitlStatus::Approved, "approve")
        } else {
            (HitlStatus::Rejected, "reject")
        };
        let modifications_raw = modifications
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .context("serialize modifications")?;

        let updated = sqlx::query(
            "UPDATE hitl_queue
             SET status = $1, reviewed_by = $2, review_decision = $3,
                 review_notes = $4, modifications = $5,
                 reviewed_at = $6, resolved_at = $6
             WHERE id = $7 AND status = $8",
        )
        .bind(new_status.to_string())
        .bind(reviewer)
        .bind(review_decision)
        .bind(notes)
        .bind(&modifications_raw)
        .bind(now.to_rfc3339())
        .bind(entry_id)
        .bind(entry.status.to_string())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(ArchonError::Hitl(HitlError::NotOpen {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            }));
        }

        let decision_status = if approve {
            DecisionStatus::Approved
        } else {
            DecisionStatus::Rejected
        };
        let decision = transition_tx(
            &mut tx,
            &entry.decision_id,
            decision_status,
            &TransitionEvidence::by(Actor::human(reviewer)),
        )
        .await?;

        let (action, severity) = if approve {
            (AuditAction::HitlApproved, Severity::Info)
        } else {
            (AuditAction::HitlRejected, Severity::Warning)
        };
        let event = AuditEvent::new(action, Actor::human(reviewer))
            .target("decision", &entry.decision_id)
            .organization(&entry.organization_id)
            .severity(severity)
            .context(serde_json::json!({
                "entry_id": entry_id,
                "notes": notes,
                "modifications": modifications,
            }));
        append_tx(&mut tx, &event).await?;

        let work_item = if approve {
            Some(
                enqueue_tx(
                    &mut tx,
                    &decision.agent_id,
                    &decision.category,
                    serde_json::json!({"decision_id": decision.decision_id}),
                )
                .await?,
            )
        } else {
            None
        };

        tx.commit().await?;

        let entry = self.require(entry_id).await?;
        Ok(ReviewResolution {
            entry,
            decision,
            work_item,
        })
    }

    /// Escalate an expired entry: priority is raised, the entry reopens and
    /// the target is re-notified. Bounded by the configured hop cap.
    pub async fn escalate(
        &self,
        entry_id: &str,
        target: &str,
        reason: &str,
    ) -> Result<HitlEntry> {
        let entry = self.require(entry_id).await?;
        if entry.status != HitlStatus::Expired {
            return Err(ArchonError::Hitl(HitlError::NotExpired {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            }));
        }
        if entry.escalation_hops >= self.config.max_escalation_hops {
            return Err(ArchonError::Hitl(HitlError::EscalationCapReached {
                id: entry_id.to_string(),
                cap: self.config.max_escalation_hops,
            }));
        }

        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let updated = sqlx::query(
            "UPDATE hitl_queue
             SET status = 'escalated', escalated_to = $1, escalation_reason = $2,
                 escalation_hops = escalation_hops + 1,
                 priority = $3, assigned_to = $1, assigned_at = $4, assigned_by = 'escalation'
             WHERE id = $5 AND status = 'expired'",
        )
        .bind(target)
        .bind(reason)
        .bind(entry.priority.bumped().to_string())
        .bind(now.to_rfc3339())
        .bind(entry_id)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(ArchonError::Hitl(HitlError::NotExpired {
                id: entry_id.to_string(),
                status: entry.status.to_string(),
            }));
        }

        let event = AuditEvent::new(AuditAction::HitlEscalated, Actor::system())
            .target("decision", &entry.decision_id)
            .organization(&entry.organization_id)
            .severity(Severity::Warning)
            .context(serde_json::json!({
                "entry_id": entry_id,
                "escalated_to": target,
                "reason": reason,
                "hop": entry.escalation_hops + 1,
            }));
        append_tx(&mut tx, &event).await?;
        tx.commit().await?;

        self.notify_entry(entry_id).await;
        self.require(entry_id).await
    }

    /// Expire open entries whose SLA has passed. Idempotent: every expiry is
    /// compare-and-set, so a second sweep (or a racing human action) finds
    /// nothing left to do. Returns the newly expired entries.
    pub async fn sweep_overdue(&self, now: DateTime<Utc>) -> Result<Vec<HitlEntry>> {
        let overdue: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM hitl_queue
             WHERE status IN ('pending', 'notified', 'in_review')
               AND sla_deadline < $1",
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await
        .context("query overdue entries")?;

        let mut expired = Vec::new();
        for (id,) in overdue {
            let mut tx = self.pool.begin().await?;
            let Some(entry) = fetch_entry(&mut tx, &id).await? else {
                continue;
            };
            let updated = sqlx::query(
                "UPDATE hitl_queue
                 SET status = 'expired', is_overdue = 1, resolved_at = $1
                 WHERE id = $2 AND status IN ('pending', 'notified', 'in_review')",
            )
            .bind(now.to_rfc3339())
            .bind(&id)
            .execute(&mut *tx)
            .await?;
            if updated.rows_affected() == 0 {
                // A human action won the race; their terminal state stands.
                continue;
            }

            let event = AuditEvent::new(AuditAction::HitlExpired, Actor::system())
                .target("decision", &entry.decision_id)
                .organization(&entry.organization_id)
                .severity(Severity::Warning)
                .context(serde_json::json!({
                    "entry_id": id,
                    "sla_deadline": entry.sla_deadline.to_rfc3339(),
                }));
            append_tx(&mut tx, &event).await?;
            tx.commit().await?;

            if let Some(entry) = self.get(&id).await? {
                expired.push(entry);
            }
        }

        Ok(expired)
    }

    /// Open entries, newest first, optionally filtered.
    pub async fn pending(&self, filter: &HitlFilter) -> Result<Vec<HitlEntry>> {
        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM hitl_queue
             WHERE status IN ('pending', 'notified', 'in_review')"
        );
        let mut binds: Vec<String> = Vec::new();
        if let Some(org) = &filter.organization_id {
            sql.push_str(" AND organization_id = ?");
            binds.push(org.clone());
        }
        if let Some(assignee) = &filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            binds.push(assignee.clone());
        }
        if let Some(priority) = filter.priority {
            sql.push_str(" AND priority = ?");
            binds.push(priority.to_string());
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut stmt = sqlx::query(&sql);
        for bind in &binds {
            stmt = stmt.bind(bind);
        }
        let rows = stmt
            .fetch_all(&self.pool)
            .await
            .context("list pending entries")?;

        rows.iter().map(map_entry_row).collect()
    }

    pub async fn get(&self, entry_id: &str) -> Result<Option<HitlEntry>> {
        let mut conn = self.pool.acquire().await?;
        fetch_entry(&mut conn, entry_id).await
    }

    async fn require(&self, entry_id: &str) -> Result<HitlEntry> {
        self.get(entry_id).await?.ok_or_else(|| {
            ArchonError::Hitl(HitlError::NotFound(entry_id.to_string()))
        })
    }
}

fn summarize(decision: &Decision) -> String {
    let excerpt: String = decision.response.chars().take(200).collect();
    format!(
        "Agent: {}\nCategory: {}\nConfidence: {:.0}%\nRisk: {:.0}%\n\nRecommendation:\n{}",
        decision.agent_id,
        decision.category,
        decision.confidence * 100.0,
        decision.risk * 100.0,
        excerpt
    )
}

async fn fetch_entry(
    conn: &mut SqliteConnection,
    entry_id: &str,
) -> Result<Option<HitlEntry>> {
    let row = sqlx::query(&format!(
        "SELECT {ENTRY_COLUMNS} FROM hitl_queue WHERE id = $1"
    ))
    .bind(entry_id)
    .fetch_optional(conn)
    .await
    .context("query hitl entry")?;

    row.map(|r| map_entry_row(&r)).transpose()
}

fn parse_optional(raw: Option<String>) -> Result<Option<chrono::DateTime<Utc>>> {
    Ok(raw
        .map(|value| crate::audit::parse_timestamp(&value))
        .transpose()?)
}

fn map_entry_row(row: &SqliteRow) -> Result<HitlEntry> {
    let status_raw: String = row.try_get("status")?;
    let priority_raw: String = row.try_get("priority")?;
    let triggers_raw: String = row.try_get("triggers")?;
    let modifications_raw: Option<String> = row.try_get("modifications")?;
    let is_overdue: i64 = row.try_get("is_overdue")?;
    let attempts: i64 = row.try_get("notification_attempts")?;
    let hops: i64 = row.try_get("escalation_hops")?;
    let sla_raw: String = row.try_get("sla_deadline")?;
    let created_raw: String = row.try_get("created_at")?;
    let assigned_at_raw: Option<String> = row.try_get("assigned_at")?;
    let notified_at_raw: Option<String> = row.try_get("notified_at")?;
    let reviewed_at_raw: Option<String> = row.try_get("reviewed_at")?;
    let resolved_at_raw: Option<String> = row.try_get("resolved_at")?;

    Ok(HitlEntry {
        id: row.try_get("id")?,
        decision_id: row.try_get("decision_id")?,
        agent_id: row.try_get("agent_id")?,
        user_id: row.try_get("user_id")?,
        organization_id: row.try_get("organization_id")?,
        summary: row.try_get("summary")?,
        recommendation: row.try_get("recommendation")?,
        confidence: row.try_get("confidence")?,
        risk: row.try_get("risk")?,
        reason: row.try_get("reason")?,
        triggers: serde_json::from_str(&triggers_raw).context("deserialize triggers")?,
        status: HitlStatus::from_str(&status_raw)
            .with_context(|| format!("unknown hitl status: {status_raw}"))?,
        priority: ReviewPriority::from_str(&priority_raw)
            .with_context(|| format!("unknown priority: {priority_raw}"))?,
        sla_deadline: crate::audit::parse_timestamp(&sla_raw)?,
        is_overdue: is_overdue != 0,
        assigned_to: row.try_get("assigned_to")?,
        assigned_at: parse_optional(assigned_at_raw)?,
        assigned_by: row.try_get("assigned_by")?,
        reviewed_by: row.try_get("reviewed_by")?,
        review_decision: row.try_get("review_decision")?,
        review_notes: row.try_get("review_notes")?,
        modifications: modifications_raw
            .map(|raw| serde_json::from_str(&raw))
            .transpose()
            .context("deserialize modifications")?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        notification_attempts: attempts as u32,
        notified_at: parse_optional(notified_at_raw)?,
        escalated_to: row.try_get("escalated_to")?,
        escalation_reason: row.try_get("escalation_reason")?,
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        escalation_hops: hops as u32,
        created_at: crate::audit::parse_timestamp(&created_raw)?,
        reviewed_at: parse_optional(reviewed_at_raw)?,
        resolved_at: parse_optional(resolved_at_raw)?,
    })
}
