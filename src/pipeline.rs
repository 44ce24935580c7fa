use crate::audit::SqliteAuditLedger;
use crate::config::GovernanceConfig;
use crate::decision::{CandidateDecision, Decision, SqliteDecisionStore};
use crate::dispatch::{DispatchExecutor, HandlerRegistry, SqliteWorkQueue, WorkItem};
use crate::error::Result;
use crate::firewall::ReleaseFirewall;
use crate::hitl::{EvalOutcome, HitlEntry, HitlGate, ReviewPriority};
use crate::notify::{LogNotifier, NotificationChannel};
use crate::rollback::RollbackEngine;
use sqlx::sqlite::SqlitePool;
use std::sync::Arc;

/// What happened to a submitted candidate.
#[derive(Debug)]
pub enum Submission {
    /// Shadow mode: recorded and evaluated, never executed.
    Shadow {
        decision: Decision,
        evaluation: EvalOutcome,
    },
    /// The gate flagged it; a human review entry is open.
    UnderReview {
        decision: Decision,
        entry: HitlEntry,
    },
    /// Auto-cleared; queued for execution by the dispatch loop.
    Queued {
        decision: Decision,
        work_item: WorkItem,
    },
}

impl Submission {
    #[must_use]
    pub fn decision(&self) -> &Decision {
        match self {
            Submission::Shadow { decision, .. }
            | Submission::UnderReview { decision, .. }
            | Submission::Queued { decision, .. } => decision,
        }
    }
}

/// Front door of the governance pipeline: wires the stores, the gate, the
/// firewall, the rollback engine and the dispatch worker over one pool.
pub struct GovernancePipeline {
    pool: SqlitePool,
    config: GovernanceConfig,
    decisions: SqliteDecisionStore,
    gate: Arc<HitlGate>,
    firewall: ReleaseFirewall,
    rollback: RollbackEngine,
    queue: SqliteWorkQueue,
    ledger: SqliteAuditLedger,
}

impl GovernancePipeline {
    pub fn new(pool: SqlitePool, config: GovernanceConfig) -> Self {
        Self::with_notifier(pool, config, Arc::new(LogNotifier))
    }

    pub fn with_notifier(
        pool: SqlitePool,
        config: GovernanceConfig,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let gate = Arc::new(HitlGate::new(pool.clone(), config.hitl.clone(), notifier));
        Self {
            decisions: SqliteDecisionStore::new(pool.clone()),
            firewall: ReleaseFirewall::new(pool.clone()),
            rollback: RollbackEngine::new(SqliteDecisionStore::new(pool.clone())),
            queue: SqliteWorkQueue::new(pool.clone()),
            ledger: SqliteAuditLedger::new(pool.clone()),
            gate,
            config,
            pool,
        }
    }

    /// Record a candidate, run the gate and route it: shadow stops here,
    /// flagged decisions open a review, cleared ones queue for execution.
    pub async fn submit(&self, mut candidate: CandidateDecision) -> Result<Submission> {
        if self.config.shadow.enabled {
            candidate.shadow = true;
        }

        let decision = self.decisions.create(candidate).await?;
        let evaluation = self.gate.evaluate(&decision);

        if decision.shadow {
            return Ok(Submission::Shadow {
                decision,
                evaluation,
            });
        }

        if evaluation.requires_review {
            let entry = self
                .gate
                .request_review(
                    &decision,
                    &evaluation.reason(),
                    &evaluation.triggers,
                    ReviewPriority::from_risk(decision.risk),
                    self.config.hitl.default_sla_minutes,
                )
                .await?;
            let decision = self
                .decisions
                .get(&decision.decision_id)
                .await?
                .unwrap_or(decision);
            return Ok(Submission::UnderReview { decision, entry });
        }

        let work_item = self
            .queue
            .enqueue(
                &decision.agent_id,
                &decision.category,
                serde_json::json!({"decision_id": decision.decision_id}),
            )
            .await?;
        Ok(Submission::Queued {
            decision,
            work_item,
        })
    }

    /// Build the background worker for this pipeline.
    #[must_use]
    pub fn executor(&self, registry: Arc<HandlerRegistry>) -> DispatchExecutor {
        DispatchExecutor::new(self.pool.clone(), registry, self.config.dispatch.clone())
            .with_gate(self.gate.clone())
    }

    pub fn decisions(&self) -> &SqliteDecisionStore {
        &self.decisions
    }

    pub fn gate(&self) -> &Arc<HitlGate> {
        &self.gate
    }

    pub fn firewall(&self) -> &ReleaseFirewall {
        &self.firewall
    }

    pub fn firewall_mut(&mut self) -> &mut ReleaseFirewall {
        &mut self.firewall
    }

    pub fn rollback(&self) -> &RollbackEngine {
        &self.rollback
    }

    pub fn rollback_mut(&mut self) -> &mut RollbackEngine {
        &mut self.rollback
    }

    pub fn queue(&self) -> &SqliteWorkQueue {
        &self.queue
    }

    pub fn ledger(&self) -> &SqliteAuditLedger {
        &self.ledger
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }
}
