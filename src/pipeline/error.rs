use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::UnboundStage;
use crate::evaluator::EvaluationError;
use crate::gateway::ProviderError;
use crate::retry::Retryable;

use super::config::ConfigError;
use super::types::Stage;

/// Coarse classification of a run failure, carried on `error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable failures that outlasted the retry budget.
    Transient,
    Fatal,
    Cancelled,
    InvalidRequest,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest => "invalid_request",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    UnboundStage(#[from] UnboundStage),
    #[error("stage {stage} failed after {attempts} attempt(s): {source}")]
    Agent {
        stage: Stage,
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("stage {stage} evaluation failed: {source}")]
    Evaluation {
        stage: Stage,
        #[source]
        source: EvaluationError,
    },
    #[error("run cancelled{}", .stage.map(|s| format!(" during {s}")).unwrap_or_default())]
    Cancelled { stage: Option<Stage> },
    #[error("run task failed: {0}")]
    Join(String),
}

impl PipelineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::InvalidRequest(_) => FailureKind::InvalidRequest,
            Self::Config(_) | Self::UnboundStage(_) | Self::Join(_) => FailureKind::Fatal,
            Self::Agent { source, .. } => {
                if source.is_retryable() {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                }
            }
            Self::Evaluation { source, .. } => {
                if source.is_retryable() {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                }
            }
            Self::Cancelled { .. } => FailureKind::Cancelled,
        }
    }

    /// Stage at which the run failed, if it got that far.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::InvalidRequest(_) | Self::Config(_) | Self::Join(_) => None,
            Self::UnboundStage(UnboundStage(stage)) => Some(*stage),
            Self::Agent { stage, .. } | Self::Evaluation { stage, .. } => Some(*stage),
            Self::Cancelled { stage } => *stage,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn kind_follows_retryability() {
        let transient = PipelineError::Agent {
            stage: Stage::Writer,
            attempts: 3,
            source: ProviderError::Timeout(Duration::from_secs(1), None),
        };
        assert_eq!(transient.kind(), FailureKind::Transient);
        assert_eq!(transient.stage(), Some(Stage::Writer));

        let fatal = PipelineError::Agent {
            stage: Stage::Editor,
            attempts: 1,
            source: ProviderError::malformed("openai", "no choices"),
        };
        assert_eq!(fatal.kind(), FailureKind::Fatal);

        let unbound: PipelineError = UnboundStage(Stage::Critic).into();
        assert_eq!(unbound.kind(), FailureKind::Fatal);
        assert_eq!(unbound.stage(), Some(Stage::Critic));
    }

    #[test]
    fn cancelled_message_names_stage() {
        let err = PipelineError::Cancelled {
            stage: Some(Stage::Writer),
        };
        assert_eq!(err.to_string(), "run cancelled during writer");
        assert_eq!(PipelineError::Cancelled { stage: None }.to_string(), "run cancelled");
        assert_eq!(
            serde_json::to_value(FailureKind::InvalidRequest).unwrap(),
            "invalid_request"
        );
    }
}
