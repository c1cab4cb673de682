//! Pipeline configuration, loadable from JSON with a default for every field.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::AgentBinding;
use crate::evaluator::ScoringWeights;
use crate::gateway::ProviderKind;
use crate::retry::RetryPolicy;

use super::types::Stage;

fn default_quality_threshold() -> f64 {
    9.5
}

fn default_max_refinement_attempts() -> u32 {
    3
}

fn default_cache_ttl_secs() -> u64 {
    86_400
}

fn default_bindings() -> BTreeMap<Stage, AgentBinding> {
    AgentBinding::defaults()
}

fn default_judge() -> AgentBinding {
    AgentBinding::new(ProviderKind::OpenAi, "gpt-4", 0.0).max_tokens(512)
}

/// Which candidate a stage keeps when its refinement budget runs out below
/// the threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptancePolicy {
    /// The last candidate produced, even if an earlier one scored higher.
    MostRecent,
    /// The highest-scoring candidate; the earliest wins ties.
    #[default]
    BestSeen,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluatorKind {
    #[default]
    Heuristic,
    /// Ask the `judge` binding for sub-scores.
    Llm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Minimum composite score (0-10) accepted without refinement.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,
    /// Candidates produced per stage at most, including the first.
    #[serde(default = "default_max_refinement_attempts")]
    pub max_refinement_attempts: u32,
    #[serde(default)]
    pub acceptance: AcceptancePolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Bound on a single provider call; expiry counts as a transient failure.
    #[serde(default)]
    pub stage_timeout_secs: Option<f64>,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default = "default_bindings")]
    pub bindings: BTreeMap<Stage, AgentBinding>,
    #[serde(default)]
    pub evaluator: EvaluatorKind,
    #[serde(default = "default_judge")]
    pub judge: AgentBinding,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_refinement_attempts: default_max_refinement_attempts(),
            acceptance: AcceptancePolicy::default(),
            retry: RetryPolicy::default(),
            stage_timeout_secs: None,
            cache_ttl_secs: default_cache_ttl_secs(),
            weights: ScoringWeights::default(),
            bindings: default_bindings(),
            evaluator: EvaluatorKind::default(),
            judge: default_judge(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.quality_threshold.is_finite() || !(0.0..=10.0).contains(&self.quality_threshold) {
            return Err(ConfigError::Invalid(format!(
                "quality_threshold must be within 0..=10, got {}",
                self.quality_threshold
            )));
        }
        if self.max_refinement_attempts == 0 {
            return Err(ConfigError::Invalid(
                "max_refinement_attempts must be at least 1".into(),
            ));
        }
        if let Some(secs) = self.stage_timeout_secs {
            if !secs.is_finite() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "stage_timeout_secs must be a positive, representable duration, got {secs}"
                )));
            }
        }
        self.retry
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.weights
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        for (stage, binding) in &self.bindings {
            if binding.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("stage {stage} has an empty model")));
            }
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    pub fn refinement_budget(mut self, attempts: u32) -> Self {
        self.max_refinement_attempts = attempts;
        self
    }

    pub fn acceptance(mut self, policy: AcceptancePolicy) -> Self {
        self.acceptance = policy;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn stage_timeout_secs(mut self, secs: f64) -> Self {
        self.stage_timeout_secs = Some(secs);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config: PipelineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.quality_threshold, 9.5);
        assert_eq!(config.acceptance, AcceptancePolicy::BestSeen);
        assert_eq!(config.bindings.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"quality_threshold": 8.0, "acceptance": "most_recent",
                "retry": {"max_attempts": 5}, "evaluator": "llm"}"#,
        )
        .unwrap();
        assert_eq!(config.quality_threshold, 8.0);
        assert_eq!(config.acceptance, AcceptancePolicy::MostRecent);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay, 1.0);
        assert_eq!(config.evaluator, EvaluatorKind::Llm);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(PipelineConfig::default().threshold(11.0).validate().is_err());
        assert!(PipelineConfig::default().refinement_budget(0).validate().is_err());
        assert!(PipelineConfig::default()
            .stage_timeout_secs(0.0)
            .validate()
            .is_err());
        let mut config = PipelineConfig::default();
        config.weights.market = 0.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn oversized_timeouts_and_delays_fail_validation_without_panicking() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"stage_timeout_secs": 1e20}"#).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        assert_eq!(config.stage_timeout(), Some(Duration::MAX));

        let config: PipelineConfig =
            serde_json::from_str(r#"{"retry": {"initial_delay": 1e20, "max_delay": 1e20}}"#)
                .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = PipelineConfig::default().stage_timeout_secs(90.0);
        assert!(config.validate().is_ok());
        assert_eq!(config.stage_timeout(), Some(Duration::from_secs(90)));
    }
}
