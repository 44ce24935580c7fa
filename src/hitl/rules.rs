use crate::config::HitlConfig;
use crate::decision::Decision;

/// One review-trigger rule: a stable identifier plus a predicate over the
/// decision and gate configuration.
pub struct GateRule {
    pub id: &'static str,
    predicate: Box<dyn Fn(&Decision, &HitlConfig) -> bool + Send + Sync>,
}

impl GateRule {
    pub fn new(
        id: &'static str,
        predicate: impl Fn(&Decision, &HitlConfig) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            id,
            predicate: Box::new(predicate),
        }
    }

    #[must_use]
    pub fn matches(&self, decision: &Decision, config: &HitlConfig) -> bool {
        (self.predicate)(decision, config)
    }
}

/// Result of gate evaluation: whether review is required, which rule decided
/// it, and the complete set of rules that fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalOutcome {
    pub requires_review: bool,
    /// First matching rule; the human-readable reason is derived from it.
    pub primary_trigger: Option<String>,
    /// Every rule that matched, so later triggers are not lost.
    pub triggers: Vec<String>,
}

impl EvalOutcome {
    #[must_use]
    pub fn clear() -> Self {
        Self {
            requires_review: false,
            primary_trigger: None,
            triggers: Vec::new(),
        }
    }

    #[must_use]
    pub fn reason(&self) -> String {
        match &self.primary_trigger {
            Some(trigger) => format!("review required: {trigger}"),
            None => "autonomous execution permitted".into(),
        }
    }
}

/// Ordered rule list. First match decides, all matches are recorded.
pub struct RuleSet {
    rules: Vec<GateRule>,
}

fn context_number(decision: &Decision, key: &str) -> Option<f64> {
    decision
        .request_context
        .as_ref()
        .and_then(|ctx| ctx.get(key))
        .and_then(serde_json::Value::as_f64)
}

impl RuleSet {
    pub fn new(rules: Vec<GateRule>) -> Self {
        Self { rules }
    }

    /// The stock rules, in evaluation order.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(vec![
            GateRule::new("low_confidence", |decision, config| {
                decision.confidence < config.threshold_for(&decision.agent_id)
            }),
            GateRule::new("uncertainty_keyword", |decision, config| {
                let response = decision.response.to_lowercase();
                config
                    .uncertainty_keywords
                    .iter()
                    .any(|keyword| response.contains(&keyword.to_lowercase()))
            }),
            GateRule::new("amount_cap", |decision, config| {
                context_number(decision, "amount")
                    .is_some_and(|amount| amount > config.amount_cap)
            }),
            GateRule::new("variance_cap", |decision, config| {
                context_number(decision, "variance_pct")
                    .is_some_and(|variance| variance > config.variance_cap)
            }),
            GateRule::new("category_review", |decision, config| {
                config.review_categories.contains(&decision.category)
            }),
        ])
    }

    /// Evaluate every rule in order. The first match wins the decision, but
    /// the full triggered set is returned.
    #[must_use]
    pub fn evaluate(&self, decision: &Decision, config: &HitlConfig) -> EvalOutcome {
        if !config.enabled {
            return EvalOutcome::clear();
        }

        let triggers: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(decision, config))
            .map(|rule| rule.id.to_string())
            .collect();

        EvalOutcome {
            requires_review: !triggers.is_empty(),
            primary_trigger: triggers.first().cloned(),
            triggers,
        }
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{DecisionStatus, Decision};
    use chrono::Utc;

    fn decision(confidence: f64, response: &str, category: &str) -> Decision {
        Decision {
            decision_id: "dec-1".into(),
            agent_id: "perseo".into(),
            agent_role: None,
            user_id: "user-1".into(),
            organization_id: "org-1".into(),
            request_context: None,
            rendered_prompt: None,
            response: response.into(),
            reasoning: None,
            confidence,
            risk: 0.2,
            hitl_required: false,
            status: DecisionStatus::Pending,
            rollback_eligible: false,
            rollback_data: None,
            shadow: false,
            cost: 0.0,
            tokens_used: 0,
            tags: Vec::new(),
            category: category.into(),
            execution_result: None,
            execution_error: None,
            executed_at: None,
            rolled_back_at: None,
            rolled_back_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn low_confidence_always_requires_review() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();

        for confidence in [0.0, 0.3, 0.5, 0.74] {
            let outcome = rules.evaluate(&decision(confidence, "do it", "marketing"), &config);
            assert!(outcome.requires_review, "confidence {confidence}");
            assert_eq!(outcome.primary_trigger.as_deref(), Some("low_confidence"));
        }
    }

    #[test]
    fn confident_plain_response_is_clear() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let outcome = rules.evaluate(&decision(0.9, "do it", "marketing"), &config);
        assert!(!outcome.requires_review);
        assert!(outcome.triggers.is_empty());
    }

    #[test]
    fn uncertainty_keyword_fires_case_insensitively() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let outcome = rules.evaluate(
            &decision(0.9, "I am NOT SURE this applies", "marketing"),
            &config,
        );
        assert!(outcome.requires_review);
        assert_eq!(
            outcome.primary_trigger.as_deref(),
            Some("uncertainty_keyword")
        );
    }

    #[test]
    fn amount_above_cap_fires() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let mut d = decision(0.9, "pay the invoice", "operations");
        d.request_context = Some(serde_json::json!({"amount": 2_500.0}));
        let outcome = rules.evaluate(&d, &config);
        assert!(outcome.requires_review);
        assert_eq!(outcome.primary_trigger.as_deref(), Some("amount_cap"));
    }

    #[test]
    fn variance_above_cap_fires() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let mut d = decision(0.9, "adjust forecast", "operations");
        d.request_context = Some(serde_json::json!({"variance_pct": 35.0}));
        let outcome = rules.evaluate(&d, &config);
        assert!(outcome.requires_review);
        assert_eq!(outcome.primary_trigger.as_deref(), Some("variance_cap"));
    }

    #[test]
    fn review_category_fires_unconditionally() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let outcome = rules.evaluate(&decision(0.99, "file the return", "fiscal"), &config);
        assert!(outcome.requires_review);
        assert_eq!(outcome.primary_trigger.as_deref(), Some("category_review"));
    }

    #[test]
    fn all_matching_triggers_are_recorded() {
        let rules = RuleSet::standard();
        let config = HitlConfig::default();
        let mut d = decision(0.4, "not sure about the filing", "fiscal");
        d.request_context = Some(serde_json::json!({"amount": 9_999.0}));
        let outcome = rules.evaluate(&d, &config);

        assert_eq!(outcome.primary_trigger.as_deref(), Some("low_confidence"));
        assert_eq!(
            outcome.triggers,
            vec![
                "low_confidence",
                "uncertainty_keyword",
                "amount_cap",
                "category_review"
            ]
        );
    }

    #[test]
    fn disabled_gate_never_requires_review() {
        let rules = RuleSet::standard();
        let config = HitlConfig {
            enabled: false,
            ..HitlConfig::default()
        };
        let outcome = rules.evaluate(&decision(0.1, "not sure", "fiscal"), &config);
        assert!(!outcome.requires_review);
    }

    #[test]
    fn per_agent_threshold_is_honored() {
        let rules = RuleSet::standard();
        let mut config = HitlConfig::default();
        config.agent_thresholds.insert("perseo".into(), 0.5);

        let outcome = rules.evaluate(&decision(0.6, "do it", "marketing"), &config);
        assert!(!outcome.requires_review);
    }
}
