use crate::audit::Actor;
use crate::decision::{
    Decision, DecisionStatus, SqliteDecisionStore, TransitionEvidence,
};
use crate::error::{ArchonError, RollbackError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Structured description of what a reversal undid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackOutcome {
    /// Strategy identifier, e.g. `campaign_pause` or `generic`.
    pub method: String,
    pub message: String,
    /// State the strategy restored, echoed from the rollback payload.
    pub restored: Option<serde_json::Value>,
}

/// Category-specific reversal logic. Receives only the opaque rollback
/// payload captured at execution time.
#[async_trait]
pub trait RollbackStrategy: Send + Sync {
    async fn reverse(&self, rollback_data: &serde_json::Value) -> anyhow::Result<RollbackOutcome>;
}

/// Fallback when no category strategy is registered: records the original
/// state as restored without touching any external system. Keeps rollback
/// total at the cost of being a no-op outside modeled domains.
pub struct GenericRollback;

#[async_trait]
impl RollbackStrategy for GenericRollback {
    async fn reverse(&self, rollback_data: &serde_json::Value) -> anyhow::Result<RollbackOutcome> {
        Ok(RollbackOutcome {
            method: "generic".into(),
            message: "original state recorded as restored; no domain side effects".into(),
            restored: rollback_data.get("original_state").cloned(),
        })
    }
}

/// Result of a completed rollback.
#[derive(Debug)]
pub struct RollbackReport {
    pub decision: Decision,
    pub outcome: RollbackOutcome,
}

pub struct RollbackEngine {
    store: SqliteDecisionStore,
    strategies: HashMap<String, Arc<dyn RollbackStrategy>>,
}

impl RollbackEngine {
    pub fn new(store: SqliteDecisionStore) -> Self {
        Self {
            store,
            strategies: HashMap::new(),
        }
    }

    /// Register the reversal strategy for a decision category. Replaces any
    /// existing registration.
    pub fn register(
        &mut self,
        category: impl Into<String>,
        strategy: Arc<dyn RollbackStrategy>,
    ) {
        self.strategies.insert(category.into(), strategy);
    }

    /// Eligibility check: EXECUTED, explicitly reversible, with a payload.
    pub async fn can_rollback(&self, decision_id: &str) -> Result<(bool, Option<String>)> {
        let Some(decision) = self.store.get(decision_id).await? else {
            return Ok((false, Some("decision not found".into())));
        };
        Ok(match eligibility(&decision) {
            Some(reason) => (false, Some(reason)),
            None => (true, None),
        })
    }

    /// Reverse an executed decision.
    ///
    /// Eligibility is re-checked here and again by the compare-and-set
    /// transition, so a stale `can_rollback` answer cannot slip a rollback
    /// through. Exactly one audit event records the reversal outcome.
    pub async fn rollback(
        &self,
        decision_id: &str,
        actor: Actor,
        reason: &str,
    ) -> Result<RollbackReport> {
        let decision = self
            .store
            .get(decision_id)
            .await?
            .ok_or_else(|| ArchonError::Rollback(RollbackError::NotFound(decision_id.into())))?;

        if let Some(reason) = eligibility(&decision) {
            return Err(ArchonError::Rollback(RollbackError::Ineligible { reason }));
        }
        let rollback_data = decision
            .rollback_data
            .clone()
            .unwrap_or(serde_json::Value::Null);

        let (outcome, generic) = match self.strategies.get(&decision.category) {
            Some(strategy) => {
                let outcome = strategy.reverse(&rollback_data).await.map_err(|error| {
                    ArchonError::Rollback(RollbackError::StrategyFailed {
                        category: decision.category.clone(),
                        message: error.to_string(),
                    })
                })?;
                (outcome, false)
            }
            None => {
                let outcome = GenericRollback
                    .reverse(&rollback_data)
                    .await
                    .map_err(|error| {
                        ArchonError::Rollback(RollbackError::StrategyFailed {
                            category: decision.category.clone(),
                            message: error.to_string(),
                        })
                    })?;
                (outcome, true)
            }
        };

        if generic {
            tracing::warn!(
                decision = %decision_id,
                category = %decision.category,
                "no rollback strategy registered; generic no-op reversal applied"
            );
        } else {
            tracing::info!(
                decision = %decision_id,
                method = %outcome.method,
                "rollback strategy applied"
            );
        }

        let evidence = TransitionEvidence::by(actor).result(serde_json::json!({
            "reason": reason,
            "outcome": outcome,
            "generic": generic,
        }));
        let decision = self
            .store
            .transition(decision_id, DecisionStatus::RolledBack, evidence)
            .await?;

        Ok(RollbackReport { decision, outcome })
    }
}

fn eligibility(decision: &Decision) -> Option<String> {
    if decision.status == DecisionStatus::RolledBack {
        return Some("decision already rolled back".into());
    }
    if decision.status != DecisionStatus::Executed {
        return Some(format!(
            "decision in state {}, not executed",
            decision.status
        ));
    }
    if !decision.rollback_eligible {
        return Some("decision marked as not reversible".into());
    }
    match &decision.rollback_data {
        None | Some(serde_json::Value::Null) => Some("no rollback data available".into()),
        Some(_) => None,
    }
}
