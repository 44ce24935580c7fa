use super::registry::HandlerRegistry;
use super::store::SqliteWorkQueue;
use super::types::{HandlerOutcome, HandlerStatus, WorkItem};
use crate::audit::{Actor, AuditAction, AuditEvent, Severity, SqliteAuditLedger};
use crate::config::DispatchConfig;
use crate::decision::{DecisionStatus, SqliteDecisionStore, TransitionEvidence};
use crate::error::ArchonError;
use crate::hitl::HitlGate;
use anyhow::Result;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;
use tokio::time::{self, Duration};

const MIN_POLL_SECONDS: u64 = 5;

/// What one cycle did, for logs and tests.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub expired_reviews: usize,
}

/// Interval-driven background worker: routes queued work items to registered
/// handlers and runs the HITL SLA sweep. A single bad item never stops the
/// cycle for the remaining items.
pub struct DispatchExecutor {
    queue: SqliteWorkQueue,
    decisions: SqliteDecisionStore,
    ledger: SqliteAuditLedger,
    registry: Arc<HandlerRegistry>,
    gate: Option<Arc<HitlGate>>,
    config: DispatchConfig,
}

impl DispatchExecutor {
    pub fn new(pool: SqlitePool, registry: Arc<HandlerRegistry>, config: DispatchConfig) -> Self {
        Self {
            queue: SqliteWorkQueue::new(pool.clone()),
            decisions: SqliteDecisionStore::new(pool.clone()),
            ledger: SqliteAuditLedger::new(pool),
            registry,
            gate: None,
            config,
        }
    }

    /// Attach the HITL gate so the worker also runs the periodic SLA sweep.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<HitlGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Run forever on the configured interval.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("dispatch worker disabled by config");
            return Ok(());
        }
        let poll_secs = self.config.poll_secs.max(MIN_POLL_SECONDS);
        let mut interval = time::interval(Duration::from_secs(poll_secs));

        loop {
            interval.tick().await;
            match self.process_cycle().await {
                Ok(report) => {
                    if report.processed > 0 || report.expired_reviews > 0 {
                        tracing::info!(
                            processed = report.processed,
                            completed = report.completed,
                            failed = report.failed,
                            blocked = report.blocked,
                            expired_reviews = report.expired_reviews,
                            "dispatch cycle finished"
                        );
                    }
                }
                Err(error) => {
                    tracing::warn!("dispatch cycle failed: {error}");
                }
            }
        }
    }

    /// One full cycle: process every runnable item, then sweep overdue
    /// reviews. Sweep failures are logged and retried next interval.
    pub async fn process_cycle(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let items = self.queue.fetch_runnable().await?;
        for item in items {
            report.processed += 1;
            match self.handle_item(&item).await {
                Ok(ItemDisposition::Completed) => report.completed += 1,
                Ok(ItemDisposition::Failed) => report.failed += 1,
                Ok(ItemDisposition::Blocked) => report.blocked += 1,
                Ok(ItemDisposition::Skipped) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(item = %item.id, "work item processing failed: {error}");
                }
            }
        }

        if let Some(gate) = &self.gate {
            match gate.sweep_overdue(Utc::now()).await {
                Ok(expired) => report.expired_reviews = expired.len(),
                Err(error) => {
                    tracing::warn!("sla sweep failed, retrying next interval: {error}");
                }
            }
        }

        Ok(report)
    }

    async fn handle_item(&self, item: &WorkItem) -> Result<ItemDisposition> {
        let Some(handler) = self.registry.get(&item.agent_id, &item.action_type) else {
            // Parked, not dropped: the item becomes runnable again only as a
            // new item once a handler exists.
            match self.queue.mark_blocked(&item.id).await {
                Ok(()) => {}
                Err(ArchonError::Dispatch(_)) => return Ok(ItemDisposition::Skipped),
                Err(error) => return Err(error.into()),
            }
            self.ledger
                .append(
                    AuditEvent::new(AuditAction::DispatchBlocked, Actor::system())
                        .target("work_item", &item.id)
                        .severity(Severity::Warning)
                        .context(serde_json::json!({
                            "agent": item.agent_id,
                            "action_type": item.action_type,
                        })),
                )
                .await?;
            tracing::warn!(
                item = %item.id,
                agent = %item.agent_id,
                action = %item.action_type,
                "no handler registered; item parked"
            );
            return Ok(ItemDisposition::Blocked);
        };

        let outcome = match handler.handle(item).await {
            Ok(outcome) => outcome,
            Err(error) => HandlerOutcome::failed(format!("handler error: {error}")),
        };

        let declared = outcome.declared_status();
        let updated = match self.queue.apply_outcome(item, &outcome).await {
            Ok(updated) => updated,
            // Someone else already moved the item; re-running must not
            // double-apply side effects.
            Err(ArchonError::Dispatch(_)) => return Ok(ItemDisposition::Skipped),
            Err(error) => return Err(error.into()),
        };

        let (action, disposition) = match declared {
            HandlerStatus::Completed | HandlerStatus::ExecutedInternal => {
                (AuditAction::DispatchCompleted, ItemDisposition::Completed)
            }
            HandlerStatus::Failed => (AuditAction::DispatchFailed, ItemDisposition::Failed),
        };

        let mut event = AuditEvent::new(action, Actor::agent(&item.agent_id))
            .target("work_item", &item.id)
            .context(serde_json::json!({
                "action_type": item.action_type,
                "status": updated.status,
                "notes": updated.notes,
            }));
        if declared == HandlerStatus::Failed {
            event = event.failed(
                outcome
                    .notes
                    .clone()
                    .unwrap_or_else(|| "handler reported failure".into()),
            );
        }
        self.ledger.append(event).await?;

        self.apply_decision_side_effect(&updated, declared, &outcome)
            .await;

        Ok(disposition)
    }

    /// Approved and auto-cleared decisions execute through the loop: when an
    /// item carries a decision id, its outcome drives the decision's
    /// EXECUTED/FAILED transition. Conflicts mean another worker already
    /// applied it and are not errors.
    async fn apply_decision_side_effect(
        &self,
        item: &WorkItem,
        declared: HandlerStatus,
        outcome: &HandlerOutcome,
    ) {
        let Some(decision_id) = item.decision_id() else {
            return;
        };

        let result = match declared {
            HandlerStatus::Completed | HandlerStatus::ExecutedInternal => {
                let mut evidence = TransitionEvidence::by(Actor::agent(&item.agent_id))
                    .result(serde_json::json!({
                        "work_item": item.id,
                        "metrics": item.metrics,
                        "notes": item.notes,
                    }));
                if let Some(rollback_data) = &outcome.rollback_data {
                    evidence = evidence.rollback_data(rollback_data.clone());
                }
                self.decisions
                    .transition(decision_id, DecisionStatus::Executed, evidence)
                    .await
            }
            HandlerStatus::Failed => {
                let evidence = TransitionEvidence::by(Actor::agent(&item.agent_id)).error(
                    outcome
                        .notes
                        .clone()
                        .unwrap_or_else(|| "handler reported failure".into()),
                );
                self.decisions
                    .transition(decision_id, DecisionStatus::Failed, evidence)
                    .await
            }
        };

        if let Err(error) = result {
            tracing::warn!(
                decision = %decision_id,
                item = %item.id,
                "decision transition skipped: {error}"
            );
        }
    }
}

enum ItemDisposition {
    Completed,
    Failed,
    Blocked,
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::config::HitlConfig;
    use crate::db;
    use crate::decision::CandidateDecision;
    use crate::dispatch::{WorkHandler, WorkStatus};
    use crate::notify::LogNotifier;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WorkHandler for CountingHandler {
        async fn handle(&self, _item: &WorkItem) -> anyhow::Result<HandlerOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::completed()
                .metric("calls", serde_json::json!(1))
                .notes("handled"))
        }
    }

    struct PanickyHandler;

    #[async_trait]
    impl WorkHandler for PanickyHandler {
        async fn handle(&self, _item: &WorkItem) -> anyhow::Result<HandlerOutcome> {
            anyhow::bail!("integration exploded")
        }
    }

    struct ExecuteDecisionHandler;

    #[async_trait]
    impl WorkHandler for ExecuteDecisionHandler {
        async fn handle(&self, _item: &WorkItem) -> anyhow::Result<HandlerOutcome> {
            Ok(HandlerOutcome::completed()
                .rollback_data(serde_json::json!({"campaign_id": "c-7"})))
        }
    }

    fn candidate() -> CandidateDecision {
        CandidateDecision {
            agent_id: "perseo".into(),
            agent_role: None,
            user_id: "user-1".into(),
            organization_id: "org-1".into(),
            request_context: None,
            rendered_prompt: None,
            response: "do the thing".into(),
            reasoning: None,
            confidence: 0.95,
            risk: 0.1,
            category: "marketing".into(),
            tags: Vec::new(),
            cost: 0.0,
            tokens_used: 0,
            rollback_eligible: false,
            rollback_data: None,
            shadow: false,
        }
    }

    #[tokio::test]
    async fn cycle_routes_items_and_isolates_failures() {
        let pool = db::connect_in_memory().await.unwrap();
        let mut registry = HandlerRegistry::new();
        let counting = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        registry.register("perseo", "marketing", counting.clone());
        registry.register("thalos", "security_scan", Arc::new(PanickyHandler));

        let executor = DispatchExecutor::new(
            pool.clone(),
            Arc::new(registry),
            DispatchConfig::default(),
        );
        let queue = SqliteWorkQueue::new(pool.clone());

        let ok_item = queue
            .enqueue("perseo", "marketing", serde_json::json!({}))
            .await
            .unwrap();
        let bad_item = queue
            .enqueue("thalos", "security_scan", serde_json::json!({}))
            .await
            .unwrap();
        let orphan = queue
            .enqueue("ghost", "unregistered", serde_json::json!({}))
            .await
            .unwrap();

        let report = executor.process_cycle().await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.blocked, 1);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);

        assert_eq!(
            queue.get(&ok_item.id).await.unwrap().unwrap().status,
            WorkStatus::Completed
        );
        let failed = queue.get(&bad_item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, WorkStatus::Failed);
        assert!(failed.notes.unwrap().contains("integration exploded"));
        assert_eq!(
            queue.get(&orphan.id).await.unwrap().unwrap().status,
            WorkStatus::BlockedMissingHandler
        );

        let ledger = SqliteAuditLedger::new(pool);
        let blocked_events = ledger
            .query(&AuditQuery {
                action: Some(AuditAction::DispatchBlocked),
                ..AuditQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(blocked_events.len(), 1);
    }

    #[tokio::test]
    async fn second_cycle_does_not_reprocess_terminal_items() {
        let pool = db::connect_in_memory().await.unwrap();
        let mut registry = HandlerRegistry::new();
        let counting = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
        });
        registry.register("perseo", "marketing", counting.clone());

        let executor = DispatchExecutor::new(
            pool.clone(),
            Arc::new(registry),
            DispatchConfig::default(),
        );
        let queue = SqliteWorkQueue::new(pool);
        queue
            .enqueue("perseo", "marketing", serde_json::json!({}))
            .await
            .unwrap();

        executor.process_cycle().await.unwrap();
        let report = executor.process_cycle().await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn decision_bound_item_executes_the_decision() {
        let pool = db::connect_in_memory().await.unwrap();
        let store = SqliteDecisionStore::new(pool.clone());
        let decision = store.create(candidate()).await.unwrap();
        store
            .transition(
                &decision.decision_id,
                DecisionStatus::Approved,
                TransitionEvidence::by(Actor::human("reviewer-1")),
            )
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("perseo", "marketing", Arc::new(ExecuteDecisionHandler));
        let executor = DispatchExecutor::new(
            pool.clone(),
            Arc::new(registry),
            DispatchConfig::default(),
        );
        let queue = SqliteWorkQueue::new(pool);
        queue
            .enqueue(
                "perseo",
                "marketing",
                serde_json::json!({"decision_id": decision.decision_id}),
            )
            .await
            .unwrap();

        executor.process_cycle().await.unwrap();

        let executed = store.get(&decision.decision_id).await.unwrap().unwrap();
        assert_eq!(executed.status, DecisionStatus::Executed);
        assert!(executed.rollback_eligible);
        assert_eq!(
            executed.rollback_data,
            Some(serde_json::json!({"campaign_id": "c-7"}))
        );
    }

    #[tokio::test]
    async fn failing_handler_fails_the_bound_decision() {
        let pool = db::connect_in_memory().await.unwrap();
        let store = SqliteDecisionStore::new(pool.clone());
        let decision = store.create(candidate()).await.unwrap();
        store
            .transition(
                &decision.decision_id,
                DecisionStatus::Approved,
                TransitionEvidence::by(Actor::human("reviewer-1")),
            )
            .await
            .unwrap();

        let mut registry = HandlerRegistry::new();
        registry.register("perseo", "marketing", Arc::new(PanickyHandler));
        let executor = DispatchExecutor::new(
            pool.clone(),
            Arc::new(registry),
            DispatchConfig::default(),
        );
        let queue = SqliteWorkQueue::new(pool);
        queue
            .enqueue(
                "perseo",
                "marketing",
                serde_json::json!({"decision_id": decision.decision_id}),
            )
            .await
            .unwrap();

        executor.process_cycle().await.unwrap();

        let failed = store.get(&decision.decision_id).await.unwrap().unwrap();
        assert_eq!(failed.status, DecisionStatus::Failed);
        assert!(failed.execution_error.unwrap().contains("integration exploded"));
    }

    #[tokio::test]
    async fn cycle_runs_the_sla_sweep() {
        let pool = db::connect_in_memory().await.unwrap();
        let gate = Arc::new(HitlGate::new(
            pool.clone(),
            HitlConfig::default(),
            Arc::new(LogNotifier),
        ));
        let store = SqliteDecisionStore::new(pool.clone());

        let mut low = candidate();
        low.confidence = 0.2;
        let decision = store.create(low).await.unwrap();
        // An SLA that is already past when the cycle runs.
        gate.request_review(&decision, "low confidence", &[], crate::hitl::ReviewPriority::Medium, -1)
            .await
            .unwrap();

        let executor = DispatchExecutor::new(
            pool,
            Arc::new(HandlerRegistry::new()),
            DispatchConfig::default(),
        )
        .with_gate(gate);

        let report = executor.process_cycle().await.unwrap();
        assert_eq!(report.expired_reviews, 1);

        let again = executor.process_cycle().await.unwrap();
        assert_eq!(again.expired_reviews, 0);
    }
}
