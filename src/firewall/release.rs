use super::types::{
    DocumentEvent, DocumentStatus, ExportFormat, ExportRendering, ReleasableDocument,
    ReleaseOutcome,
};
use crate::audit::{Actor, AuditAction, AuditEvent, Severity, append_tx};
use crate::error::{ArchonError, FirewallError, Result};
use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const DOCUMENT_COLUMNS: &str = "document_id, owner_id, agent_id, doc_type, payload, status,
    recipient, events, created_at, approval_requested_at, approved_at,
    sent_at, exported_at, filed_at, updated_at";

/// External transmission seam used only by `approve_and_release`.
#[async_trait]
pub trait ReleaseChannel: Send + Sync {
    fn is_configured(&self) -> bool;

    async fn send(&self, recipient: &str, rendered: &str) -> anyhow::Result<()>;
}

/// Looks up the owner's default recipient (e.g. their fiscal advisor) when
/// the caller supplies no address. Best-effort.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn recipient_for(&self, owner_id: &str, doc_type: &str) -> Option<String>;
}

/// The controlled-release firewall. Drafts never transmit synchronously; a
/// document reaches its recipient only through an explicit owner approval
/// recorded as its own event.
pub struct ReleaseFirewall {
    pool: SqlitePool,
    channel: Option<Arc<dyn ReleaseChannel>>,
    directory: Option<Arc<dyn RecipientDirectory>>,
}

impl ReleaseFirewall {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            channel: None,
            directory: None,
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: Arc<dyn ReleaseChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    #[must_use]
    pub fn with_recipient_directory(mut self, directory: Arc<dyn RecipientDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Create a document in DRAFT. There is no code path here that can
    /// transmit anything.
    pub async fn generate_draft(
        &self,
        agent_id: &str,
        owner_id: &str,
        doc_type: &str,
        payload: serde_json::Value,
    ) -> Result<ReleasableDocument> {
        let document_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload_raw = serde_json::to_string(&payload).context("serialize document payload")?;

        let recipient = match &self.directory {
            Some(directory) => directory.recipient_for(owner_id, doc_type).await,
            None => None,
        };

        let event = DocumentEvent {
            timestamp: now,
            event: "document_generated".into(),
            status: DocumentStatus::Draft,
            actor: Some(agent_id.to_string()),
            detail: None,
        };
        let events_raw =
            serde_json::to_string(&vec![&event]).context("serialize document events")?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO documents (
                 document_id, owner_id, agent_id, doc_type, payload,
                 status, recipient, events, created_at, updated_at
             ) VALUES ($1, $2, $3, $4, $5, 'draft', $6, $7, $8, $8)",
        )
        .bind(&document_id)
        .bind(owner_id)
        .bind(agent_id)
        .bind(doc_type)
        .bind(&payload_raw)
        .bind(&recipient)
        .bind(&events_raw)
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("insert document")?;

        let audit = AuditEvent::new(AuditAction::DocumentDrafted, Actor::agent(agent_id))
            .target("document", &document_id)
            .context(serde_json::json!({
                "doc_type": doc_type,
                "owner": owner_id,
            }));
        append_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.require(&document_id).await
    }

    /// DRAFT -> PENDING_APPROVAL.
    pub async fn request_approval(&self, document_id: &str) -> Result<ReleasableDocument> {
        let document = self.require(document_id).await?;
        if document.status != DocumentStatus::Draft {
            return Err(invalid_state(&document, "draft"));
        }

        self.transition(
            &document,
            DocumentStatus::PendingApproval,
            "approval_requested",
            AuditAction::DocumentApprovalRequested,
            Actor::system(),
            Severity::Info,
            None,
            "approval_requested_at",
        )
        .await
    }

    /// Owner rejection: a normal terminal outcome.
    pub async fn reject(
        &self,
        document_id: &str,
        owner_id: &str,
        notes: &str,
    ) -> Result<ReleasableDocument> {
        let document = self.require(document_id).await?;
        if !matches!(
            document.status,
            DocumentStatus::Draft | DocumentStatus::PendingApproval
        ) {
            return Err(invalid_state(&document, "draft or pending_approval"));
        }

        self.transition(
            &document,
            DocumentStatus::Rejected,
            "document_rejected",
            AuditAction::DocumentRejected,
            Actor::human(owner_id),
            Severity::Warning,
            Some(serde_json::json!({"notes": notes})),
            "",
        )
        .await
    }

    /// Record the owner's explicit approval and attempt transmission.
    ///
    /// The approval event is independent of any HITL approval of the
    /// originating decision. A missing recipient is an actionable outcome,
    /// not an error; re-releasing an already sent document is a success
    /// no-op without re-transmission; a transmission failure parks the
    /// document FAILED and the same call retries it.
    pub async fn approve_and_release(
        &self,
        document_id: &str,
        owner_id: &str,
        recipient: Option<&str>,
    ) -> Result<ReleaseOutcome> {
        let document = self.require(document_id).await?;

        match document.status {
            DocumentStatus::SentToRecipient | DocumentStatus::FiledExternal => {
                return Ok(ReleaseOutcome::AlreadySent(document));
            }
            DocumentStatus::Rejected => {
                return Err(invalid_state(&document, "an unrejected state"));
            }
            _ => {}
        }
        if !document.status.releasable() && document.status != DocumentStatus::Exported {
            return Err(invalid_state(&document, "a releasable state"));
        }

        let recipient = match recipient
            .map(str::to_string)
            .filter(|r| !r.trim().is_empty())
            .or_else(|| document.recipient.clone())
        {
            Some(recipient) => recipient,
            None => match &self.directory {
                Some(directory) => {
                    match directory
                        .recipient_for(&document.owner_id, &document.doc_type)
                        .await
                    {
                        Some(recipient) => recipient,
                        None => {
                            return Ok(ReleaseOutcome::MissingRecipient {
                                document_id: document_id.to_string(),
                            });
                        }
                    }
                }
                None => {
                    return Ok(ReleaseOutcome::MissingRecipient {
                        document_id: document_id.to_string(),
                    });
                }
            },
        };

        // Record the owner approval before any transmission attempt, unless
        // this is a retry of an already approved or failed document.
        let document = if matches!(
            document.status,
            DocumentStatus::Draft | DocumentStatus::PendingApproval
        ) {
            self.transition_with_recipient(
                &document,
                DocumentStatus::Approved,
                "document_approved",
                AuditAction::DocumentApproved,
                Actor::human(owner_id),
                Severity::Info,
                Some(serde_json::json!({"recipient": recipient})),
                "approved_at",
                Some(&recipient),
            )
            .await?
        } else {
            document
        };

        let Some(channel) = self.channel.as_ref().filter(|c| c.is_configured()) else {
            tracing::warn!(
                document = %document_id,
                "release channel not configured; approval recorded, transmission deferred"
            );
            return Ok(ReleaseOutcome::ChannelUnavailable(document));
        };

        let rendered = render(&document, ExportFormat::Json)?;
        match channel.send(&recipient, &rendered).await {
            Ok(()) => {
                // An exported document keeps its status; only the send is
                // recorded. Everything else moves to SENT_TO_RECIPIENT.
                let (target, stamp) = if document.status == DocumentStatus::Exported {
                    (DocumentStatus::Exported, "sent_at")
                } else {
                    (DocumentStatus::SentToRecipient, "sent_at")
                };
                let document = self
                    .transition_with_recipient(
                        &document,
                        target,
                        "sent_to_recipient",
                        AuditAction::DocumentSent,
                        Actor::human(owner_id),
                        Severity::Info,
                        Some(serde_json::json!({"recipient": recipient})),
                        stamp,
                        Some(&recipient),
                    )
                    .await?;
                Ok(ReleaseOutcome::Sent(document))
            }
            Err(error) => {
                let document = self
                    .transition(
                        &document,
                        DocumentStatus::Failed,
                        "send_failed",
                        AuditAction::DocumentSendFailed,
                        Actor::system(),
                        Severity::Error,
                        Some(serde_json::json!({
                            "recipient": recipient,
                            "error": error.to_string(),
                        })),
                        "",
                    )
                    .await?;
                Ok(ReleaseOutcome::Failed {
                    document,
                    error: error.to_string(),
                })
            }
        }
    }

    /// Render the stored payload for compliance handoff and mark the
    /// document EXPORTED. Allowed from any post-approval state; drafts and
    /// pending documents are not exported.
    pub async fn export(
        &self,
        document_id: &str,
        format: ExportFormat,
    ) -> Result<ExportRendering> {
        let document = self.require(document_id).await?;
        if !document.status.post_approval() {
            return Err(invalid_state(&document, "a post-approval state"));
        }

        let content = render(&document, format)?;
        let document = self
            .transition(
                &document,
                DocumentStatus::Exported,
                "document_exported",
                AuditAction::DocumentExported,
                Actor::system(),
                Severity::Info,
                Some(serde_json::json!({"format": format})),
                "exported_at",
            )
            .await?;

        Ok(ExportRendering {
            format,
            content,
            document,
        })
    }

    /// Terminal bookkeeping after the recipient (or an external authority)
    /// confirmed the filing.
    pub async fn mark_filed_externally(&self, document_id: &str) -> Result<ReleasableDocument> {
        let document = self.require(document_id).await?;
        if !matches!(
            document.status,
            DocumentStatus::SentToRecipient | DocumentStatus::Exported
        ) {
            return Err(invalid_state(&document, "sent_to_recipient or exported"));
        }

        self.transition(
            &document,
            DocumentStatus::FiledExternal,
            "filed_external",
            AuditAction::DocumentFiledExternal,
            Actor::system(),
            Severity::Info,
            None,
            "filed_at",
        )
        .await
    }

    pub async fn get(&self, document_id: &str) -> Result<Option<ReleasableDocument>> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE document_id = $1"
        ))
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .context("query document")?;

        row.map(|r| map_document_row(&r)).transpose()
    }

    async fn require(&self, document_id: &str) -> Result<ReleasableDocument> {
        self.get(document_id).await?.ok_or_else(|| {
            ArchonError::Firewall(FirewallError::NotFound(document_id.to_string()))
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn transition(
        &self,
        document: &ReleasableDocument,
        new_status: DocumentStatus,
        event_name: &str,
        action: AuditAction,
        actor: Actor,
        severity: Severity,
        detail: Option<serde_json::Value>,
        timestamp_column: &str,
    ) -> Result<ReleasableDocument> {
        self.transition_with_recipient(
            document,
            new_status,
            event_name,
            action,
            actor,
            severity,
            detail,
            timestamp_column,
            None,
        )
        .await
    }

    /// One document state change: the row update, the entry appended to the
    /// document's own event list and the global ledger event commit together.
    #[allow(clippy::too_many_arguments)]
    async fn transition_with_recipient(
        &self,
        document: &ReleasableDocument,
        new_status: DocumentStatus,
        event_name: &str,
        action: AuditAction,
        actor: Actor,
        severity: Severity,
        detail: Option<serde_json::Value>,
        timestamp_column: &str,
        recipient: Option<&str>,
    ) -> Result<ReleasableDocument> {
        let now = Utc::now();
        let mut events = document.events.clone();
        events.push(DocumentEvent {
            timestamp: now,
            event: event_name.to_string(),
            status: new_status,
            actor: Some(actor.id.clone()),
            detail: detail.clone(),
        });
        let events_raw = serde_json::to_string(&events).context("serialize document events")?;

        let stamp_sql = match timestamp_column {
            "approval_requested_at" => ", approval_requested_at = ?",
            "approved_at" => ", approved_at = ?",
            "sent_at" => ", sent_at = ?",
            "exported_at" => ", exported_at = ?",
            "filed_at" => ", filed_at = ?",
            _ => "",
        };
        let sql = format!(
            "UPDATE documents
             SET status = ?, events = ?, updated_at = ?,
                 recipient = COALESCE(?, recipient){stamp_sql}
             WHERE document_id = ? AND status = ?"
        );

        let mut tx = self.pool.begin().await?;
        let mut stmt = sqlx::query(&sql)
            .bind(new_status.to_string())
            .bind(&events_raw)
            .bind(now.to_rfc3339())
            .bind(recipient);
        if !stamp_sql.is_empty() {
            stmt = stmt.bind(now.to_rfc3339());
        }
        let updated = stmt
            .bind(&document.document_id)
            .bind(document.status.to_string())
            .execute(&mut *tx)
            .await?;

        if updated.rows_affected() == 0 {
            return Err(ArchonError::Firewall(FirewallError::InvalidState {
                id: document.document_id.clone(),
                status: document.status.to_string(),
                expected: document.status.to_string(),
            }));
        }

        let mut audit = AuditEvent::new(action, actor)
            .target("document", &document.document_id)
            .severity(severity)
            .context(serde_json::json!({
                "from": document.status.to_string(),
                "to": new_status.to_string(),
                "event": event_name,
                "detail": detail,
            }));
        if action == AuditAction::DocumentSendFailed {
            let error = detail
                .as_ref()
                .and_then(|d| d.get("error"))
                .and_then(|e| e.as_str())
                .unwrap_or("transmission failed")
                .to_string();
            audit = audit.failed(error);
        }
        append_tx(&mut tx, &audit).await?;
        tx.commit().await?;

        self.require(&document.document_id).await
    }
}

fn invalid_state(document: &ReleasableDocument, expected: &str) -> ArchonError {
    ArchonError::Firewall(FirewallError::InvalidState {
        id: document.document_id.clone(),
        status: document.status.to_string(),
        expected: expected.to_string(),
    })
}

fn render(document: &ReleasableDocument, format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => {
            let rendering = serde_json::json!({
                "document_id": document.document_id,
                "doc_type": document.doc_type,
                "owner": document.owner_id,
                "agent": document.agent_id,
                "status": document.status,
                "payload": document.payload,
                "events": document.events,
            });
            serde_json::to_string_pretty(&rendering)
                .context("render document as json")
                .map_err(ArchonError::from)
        }
        ExportFormat::Text => {
            let mut out = format!(
                "Document {}\nType: {}\nOwner: {}\nAgent: {}\nStatus: {}\n\nPayload:\n{}\n\nHistory:\n",
                document.document_id,
                document.doc_type,
                document.owner_id,
                document.agent_id,
                document.status,
                serde_json::to_string_pretty(&document.payload)
                    .context("render document payload")?
            );
            for event in &document.events {
                out.push_str(&format!(
                    "- {} {} ({})\n",
                    event.timestamp.to_rfc3339(),
                    event.event,
                    event.status
                ));
            }
            Ok(out)
        }
    }
}

fn map_document_row(row: &SqliteRow) -> Result<ReleasableDocument> {
    let status_raw: String = row.try_get("status")?;
    let payload_raw: String = row.try_get("payload")?;
    let events_raw: String = row.try_get("events")?;
    let created_raw: String = row.try_get("created_at")?;
    let updated_raw: String = row.try_get("updated_at")?;
    let approval_requested_raw: Option<String> = row.try_get("approval_requested_at")?;
    let approved_raw: Option<String> = row.try_get("approved_at")?;
    let sent_raw: Option<String> = row.try_get("sent_at")?;
    let exported_raw: Option<String> = row.try_get("exported_at")?;
    let filed_raw: Option<String> = row.try_get("filed_at")?;

    let parse_opt = |raw: Option<String>| {
        raw.map(|value| crate::audit::parse_timestamp(&value))
            .transpose()
    };

    Ok(ReleasableDocument {
        document_id: row.try_get("document_id")?,
        owner_id: row.try_get("owner_id")?,
        agent_id: row.try_get("agent_id")?,
        doc_type: row.try_get("doc_type")?,
        payload: serde_json::from_str(&payload_raw).context("deserialize document payload")?,
        status: DocumentStatus::from_str(&status_raw)
            .with_context(|| format!("unknown document status: {status_raw}"))?,
        recipient: row.try_get("recipient")?,
        events: serde_json::from_str(&events_raw).context("deserialize document events")?,
        created_at: crate::audit::parse_timestamp(&created_raw)?,
        approval_requested_at: parse_opt(approval_requested_raw)?,
        approved_at: parse_opt(approved_raw)?,
        sent_at: parse_opt(sent_raw)?,
        exported_at: parse_opt(exported_raw)?,
        filed_at: parse_opt(filed_raw)?,
        updated_at: crate::audit::parse_timestamp(&updated_raw)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditQuery, SqliteAuditLedger};
    use crate::db;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct RecordingChannel {
        sends: AtomicU32,
        fail_next: AtomicBool,
    }

    impl RecordingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sends: AtomicU32::new(0),
                fail_next: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ReleaseChannel for RecordingChannel {
        fn is_configured(&self) -> bool {
            true
        }

        async fn send(&self, _recipient: &str, _rendered: &str) -> anyhow::Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                anyhow::bail!("smtp timeout");
            }
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AdvisorDirectory;

    #[async_trait]
    impl RecipientDirectory for AdvisorDirectory {
        async fn recipient_for(&self, _owner_id: &str, doc_type: &str) -> Option<String> {
            (doc_type == "vat_return").then(|| "advisor@example.com".to_string())
        }
    }

    async fn fixture() -> (ReleaseFirewall, Arc<RecordingChannel>, SqliteAuditLedger) {
        let pool = db::connect_in_memory().await.unwrap();
        let channel = RecordingChannel::new();
        let firewall = ReleaseFirewall::new(pool.clone()).with_channel(channel.clone());
        (firewall, channel, SqliteAuditLedger::new(pool))
    }

    fn payload() -> serde_json::Value {
        serde_json::json!({"quarter": "2025-Q2", "total": 1240.5})
    }

    #[tokio::test]
    async fn draft_is_created_without_transmission() {
        let (firewall, channel, ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        assert_eq!(document.status, DocumentStatus::Draft);
        assert_eq!(document.events.len(), 1);
        assert_eq!(document.events[0].event, "document_generated");
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);

        let drafted = ledger
            .query(&AuditQuery {
                action: Some(AuditAction::DocumentDrafted),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(drafted.len(), 1);
    }

    #[tokio::test]
    async fn request_approval_requires_draft() {
        let (firewall, _channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        let pending = firewall.request_approval(&document.document_id).await.unwrap();
        assert_eq!(pending.status, DocumentStatus::PendingApproval);
        assert!(pending.approval_requested_at.is_some());

        let err = firewall.request_approval(&document.document_id).await.unwrap_err();
        assert!(matches!(
            err,
            ArchonError::Firewall(FirewallError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn release_from_pending_records_owner_approval_then_sends() {
        let (firewall, channel, ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();
        firewall.request_approval(&document.document_id).await.unwrap();

        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();

        let ReleaseOutcome::Sent(sent) = outcome else {
            panic!("expected Sent outcome");
        };
        assert_eq!(sent.status, DocumentStatus::SentToRecipient);
        assert_eq!(sent.recipient.as_deref(), Some("advisor@example.com"));
        assert!(sent.approved_at.is_some());
        assert!(sent.sent_at.is_some());
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);

        // The owner approval is its own recorded event, before the send.
        let names: Vec<_> = sent.events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "document_generated",
                "approval_requested",
                "document_approved",
                "sent_to_recipient"
            ]
        );

        let approvals = ledger
            .query(&AuditQuery {
                action: Some(AuditAction::DocumentApproved),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].actor.id, "user-1");
    }

    #[tokio::test]
    async fn tolerant_release_straight_from_draft() {
        let (firewall, _channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        assert!(outcome.is_sent());
    }

    #[tokio::test]
    async fn missing_recipient_is_actionable_not_an_error() {
        let (firewall, channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "income_statement", payload())
            .await
            .unwrap();

        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", None)
            .await
            .unwrap();
        assert!(matches!(outcome, ReleaseOutcome::MissingRecipient { .. }));
        assert_eq!(channel.sends.load(Ordering::SeqCst), 0);

        // Nothing was recorded; the document is still a draft.
        let unchanged = firewall.get(&document.document_id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, DocumentStatus::Draft);
    }

    #[tokio::test]
    async fn directory_supplies_default_recipient() {
        let pool = db::connect_in_memory().await.unwrap();
        let channel = RecordingChannel::new();
        let firewall = ReleaseFirewall::new(pool)
            .with_channel(channel.clone())
            .with_recipient_directory(Arc::new(AdvisorDirectory));

        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();
        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", None)
            .await
            .unwrap();

        let ReleaseOutcome::Sent(sent) = outcome else {
            panic!("expected Sent outcome");
        };
        assert_eq!(sent.recipient.as_deref(), Some("advisor@example.com"));
    }

    #[tokio::test]
    async fn failed_send_parks_document_and_retry_succeeds() {
        let (firewall, channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();
        channel.fail_next.store(true, Ordering::SeqCst);

        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        let ReleaseOutcome::Failed { document: failed, error } = outcome else {
            panic!("expected Failed outcome");
        };
        assert_eq!(failed.status, DocumentStatus::Failed);
        assert!(error.contains("smtp timeout"));

        // Same operation retries the transmission.
        let retry = firewall
            .approve_and_release(&document.document_id, "user-1", None)
            .await
            .unwrap();
        assert!(retry.is_sent());
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resend_after_sent_is_a_noop_success() {
        let (firewall, channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();
        firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();

        let again = firewall
            .approve_and_release(&document.document_id, "user-1", None)
            .await
            .unwrap();
        assert!(matches!(again, ReleaseOutcome::AlreadySent(_)));
        assert_eq!(channel.sends.load(Ordering::SeqCst), 1, "no re-transmission");
    }

    #[tokio::test]
    async fn unconfigured_channel_defers_transmission() {
        let pool = db::connect_in_memory().await.unwrap();
        let firewall = ReleaseFirewall::new(pool);
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        let outcome = firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        let ReleaseOutcome::ChannelUnavailable(approved) = outcome else {
            panic!("expected ChannelUnavailable outcome");
        };
        assert_eq!(approved.status, DocumentStatus::Approved);
        assert!(approved.approved_at.is_some());
    }

    #[tokio::test]
    async fn export_requires_post_approval_and_renders() {
        let (firewall, _channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        let err = firewall
            .export(&document.document_id, ExportFormat::Json)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchonError::Firewall(FirewallError::InvalidState { .. })
        ));

        firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        let rendering = firewall
            .export(&document.document_id, ExportFormat::Json)
            .await
            .unwrap();
        assert_eq!(rendering.document.status, DocumentStatus::Exported);
        assert!(rendering.content.contains("vat_return"));

        let text = firewall
            .export(&document.document_id, ExportFormat::Text)
            .await
            .unwrap();
        assert!(text.content.contains("History:"));
    }

    #[tokio::test]
    async fn filing_only_after_sent_or_exported() {
        let (firewall, _channel, _ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();

        let err = firewall
            .mark_filed_externally(&document.document_id)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchonError::Firewall(FirewallError::InvalidState { .. })
        ));

        firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        let filed = firewall
            .mark_filed_externally(&document.document_id)
            .await
            .unwrap();
        assert_eq!(filed.status, DocumentStatus::FiledExternal);
        assert!(filed.filed_at.is_some());
    }

    #[tokio::test]
    async fn rejection_is_terminal() {
        let (firewall, _channel, ledger) = fixture().await;
        let document = firewall
            .generate_draft("justicia", "user-1", "contract_review", payload())
            .await
            .unwrap();
        firewall.request_approval(&document.document_id).await.unwrap();

        let rejected = firewall
            .reject(&document.document_id, "user-1", "wrong counterparty")
            .await
            .unwrap();
        assert_eq!(rejected.status, DocumentStatus::Rejected);

        let err = firewall
            .approve_and_release(&document.document_id, "user-1", Some("a@b.c"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ArchonError::Firewall(FirewallError::InvalidState { .. })
        ));

        let rejections = ledger
            .query(&AuditQuery {
                action: Some(AuditAction::DocumentRejected),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(rejections.len(), 1);
    }

    #[tokio::test]
    async fn every_transition_appends_to_both_event_lists() {
        let (firewall, _channel, ledger) = fixture().await;
        let document = firewall
            .generate_draft("rafael", "user-1", "vat_return", payload())
            .await
            .unwrap();
        firewall.request_approval(&document.document_id).await.unwrap();
        firewall
            .approve_and_release(&document.document_id, "user-1", Some("advisor@example.com"))
            .await
            .unwrap();
        firewall
            .export(&document.document_id, ExportFormat::Json)
            .await
            .unwrap();
        firewall
            .mark_filed_externally(&document.document_id)
            .await
            .unwrap();

        let final_doc = firewall.get(&document.document_id).await.unwrap().unwrap();
        // drafted, approval_requested, approved, sent, exported, filed
        assert_eq!(final_doc.events.len(), 6);

        let trail = ledger.history("document", &document.document_id).await.unwrap();
        assert_eq!(trail.len(), 6);
    }
}
