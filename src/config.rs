use crate::error::{ArchonError, ConfigError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Top-level governance configuration.
///
/// Every section is optional in the TOML source; missing sections fall back
/// to defaults so an empty file (or `GovernanceConfig::default()`) yields a
/// working pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GovernanceConfig {
    #[serde(default)]
    pub hitl: HitlConfig,

    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub shadow: ShadowConfig,
}

/// HITL gate tuning: review-trigger rules and SLA behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HitlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Confidence threshold applied when no per-agent override exists.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    /// Per-agent overrides, keyed by agent id.
    #[serde(default)]
    pub agent_thresholds: HashMap<String, f64>,

    /// Response phrases that force review regardless of confidence.
    #[serde(default = "default_uncertainty_keywords")]
    pub uncertainty_keywords: Vec<String>,

    /// Monetary amount above which review is required.
    #[serde(default = "default_amount_cap")]
    pub amount_cap: f64,

    /// Percentage variance above which review is required.
    #[serde(default = "default_variance_cap")]
    pub variance_cap: f64,

    /// Categories whose outputs always require review (legal/fiscal domains).
    #[serde(default = "default_review_categories")]
    pub review_categories: Vec<String>,

    #[serde(default = "default_sla_minutes")]
    pub default_sla_minutes: i64,

    /// Hard cap on escalation hops for a single entry.
    #[serde(default = "default_escalation_hops")]
    pub max_escalation_hops: u32,
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.75
}

fn default_uncertainty_keywords() -> Vec<String> {
    [
        "not sure",
        "need more information",
        "requires review",
        "cannot determine",
    ]
    .map(String::from)
    .to_vec()
}

fn default_amount_cap() -> f64 {
    1_000.0
}

fn default_variance_cap() -> f64 {
    20.0
}

fn default_review_categories() -> Vec<String> {
    ["fiscal", "legal"].map(String::from).to_vec()
}

fn default_sla_minutes() -> i64 {
    15
}

fn default_escalation_hops() -> u32 {
    3
}

impl Default for HitlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: default_confidence_threshold(),
            agent_thresholds: HashMap::new(),
            uncertainty_keywords: default_uncertainty_keywords(),
            amount_cap: default_amount_cap(),
            variance_cap: default_variance_cap(),
            review_categories: default_review_categories(),
            default_sla_minutes: default_sla_minutes(),
            max_escalation_hops: default_escalation_hops(),
        }
    }
}

impl HitlConfig {
    /// Threshold for an agent, falling back to the global default.
    #[must_use]
    pub fn threshold_for(&self, agent_id: &str) -> f64 {
        self.agent_thresholds
            .get(agent_id)
            .copied()
            .unwrap_or(self.confidence_threshold)
    }
}

/// Background dispatch worker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

fn default_poll_secs() -> u64 {
    30
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_secs: default_poll_secs(),
        }
    }
}

/// Global shadow-mode default applied to new decisions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ShadowConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl GovernanceConfig {
    /// Parse a TOML document into a config, validating ranges.
    pub fn from_toml_str(raw: &str) -> crate::error::Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| ArchonError::Config(ConfigError::Load(e.to_string())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ArchonError::Config(ConfigError::Io(e)))?;
        Self::from_toml_str(&raw)
    }

    fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.hitl.confidence_threshold) {
            return Err(ArchonError::Config(ConfigError::Validation(format!(
                "hitl.confidence_threshold must be in [0,1], got {}",
                self.hitl.confidence_threshold
            ))));
        }
        for (agent, threshold) in &self.hitl.agent_thresholds {
            if !(0.0..=1.0).contains(threshold) {
                return Err(ArchonError::Config(ConfigError::Validation(format!(
                    "hitl.agent_thresholds.{agent} must be in [0,1], got {threshold}"
                ))));
            }
        }
        if self.hitl.default_sla_minutes <= 0 {
            return Err(ArchonError::Config(ConfigError::Validation(
                "hitl.default_sla_minutes must be positive".into(),
            )));
        }
        if self.dispatch.poll_secs == 0 {
            return Err(ArchonError::Config(ConfigError::Validation(
                "dispatch.poll_secs must be positive".into(),
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = GovernanceConfig::default();
        assert!(config.hitl.enabled);
        assert!((config.hitl.confidence_threshold - 0.75).abs() < f64::EPSILON);
        assert_eq!(config.hitl.default_sla_minutes, 15);
        assert_eq!(config.hitl.max_escalation_hops, 3);
        assert_eq!(config.dispatch.poll_secs, 30);
        assert!(!config.shadow.enabled);
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = GovernanceConfig::from_toml_str("").unwrap();
        assert!((config.hitl.amount_cap - 1_000.0).abs() < f64::EPSILON);
        assert!(config.hitl.review_categories.contains(&"fiscal".to_string()));
    }

    #[test]
    fn per_agent_threshold_overrides_default() {
        let config = GovernanceConfig::from_toml_str(
            r#"
            [hitl]
            confidence_threshold = 0.8

            [hitl.agent_thresholds]
            perseo = 0.6
            "#,
        )
        .unwrap();

        assert!((config.hitl.threshold_for("perseo") - 0.6).abs() < f64::EPSILON);
        assert!((config.hitl.threshold_for("rafael") - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_threshold_rejected() {
        let err = GovernanceConfig::from_toml_str(
            r#"
            [hitl]
            confidence_threshold = 1.5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("confidence_threshold"));
    }

    #[test]
    fn zero_poll_interval_rejected() {
        let err = GovernanceConfig::from_toml_str(
            r#"
            [dispatch]
            poll_secs = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("poll_secs"));
    }
}
