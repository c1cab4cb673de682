//! Run-level data model: stages, per-stage progress, run state, request and result.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::evaluator::QualityReport;

// =============================================================================
// Stage
// =============================================================================

/// One step of the generation workflow. Declaration order is execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Outliner,
    Writer,
    Editor,
    Critic,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Outliner, Stage::Writer, Stage::Editor, Stage::Critic];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Outliner => "outliner",
            Self::Writer => "writer",
            Self::Editor => "editor",
            Self::Critic => "critic",
        }
    }

    /// Position in the fixed stage order, starting at 0.
    pub fn index(self) -> usize {
        match self {
            Self::Outliner => 0,
            Self::Writer => 1,
            Self::Editor => 2,
            Self::Critic => 3,
        }
    }

    pub fn next(self) -> Option<Stage> {
        Self::ALL.get(self.index() + 1).copied()
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stage: {0}")]
pub struct UnknownStage(pub String);

impl FromStr for Stage {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "outliner" => Ok(Self::Outliner),
            "writer" => Ok(Self::Writer),
            "editor" => Ok(Self::Editor),
            "critic" => Ok(Self::Critic),
            other => Err(UnknownStage(other.to_string())),
        }
    }
}

// =============================================================================
// Per-stage progress
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Waiting,
    Running,
    Completed,
    Refining,
    Retrying,
    Failed,
    Cancelled,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Refining => "refining",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProgress {
    pub stage: Stage,
    pub status: StageStatus,
    /// UI hint, 0-100.
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Adapter attempt within the current refinement pass, 1-based; 0 before the first call.
    pub attempt: u32,
    pub max_attempts: u32,
    /// Seconds; set only while `retrying`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_delay: Option<f64>,
    pub using_cache: bool,
    /// Refinement pass, 1-based; 0 before the stage starts.
    pub refinement_attempt: u32,
}

impl AgentProgress {
    pub fn waiting(stage: Stage, max_attempts: u32) -> Self {
        Self {
            stage,
            status: StageStatus::Waiting,
            progress: 0,
            output: None,
            score: None,
            attempt: 0,
            max_attempts,
            backoff_delay: None,
            using_cache: false,
            refinement_attempt: 0,
        }
    }
}

/// Run-level quality summary, 0-10 scale.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metrics {
    pub structure: f64,
    pub writing_quality: f64,
    pub technical_aspects: f64,
    pub overall: f64,
}

/// Full state of one run. Owned by the sequencer; everyone else sees clones.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub run_id: Uuid,
    pub current_stage: Option<Stage>,
    pub stages: BTreeMap<Stage, AgentProgress>,
    pub metrics: Metrics,
}

impl RunState {
    pub fn new(run_id: Uuid, max_attempts: u32) -> Self {
        let stages = Stage::ALL
            .iter()
            .map(|&stage| (stage, AgentProgress::waiting(stage, max_attempts)))
            .collect();
        Self {
            run_id,
            current_stage: None,
            stages,
            metrics: Metrics::default(),
        }
    }

    pub fn stage(&self, stage: Stage) -> Option<&AgentProgress> {
        self.stages.get(&stage)
    }

    pub(crate) fn stage_mut(&mut self, stage: Stage) -> &mut AgentProgress {
        self.stages
            .entry(stage)
            .or_insert_with(|| AgentProgress::waiting(stage, 0))
    }
}

// =============================================================================
// Request / result
// =============================================================================

/// What to generate. Only `description` is required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<String>,
}

impl GenerationRequest {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn genre(mut self, genre: impl Into<String>) -> Self {
        self.genre = Some(genre.into());
        self
    }

    pub fn target_audience(mut self, audience: impl Into<String>) -> Self {
        self.target_audience = Some(audience.into());
        self
    }

    pub fn style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    pub fn tone(mut self, tone: impl Into<String>) -> Self {
        self.tone = Some(tone.into());
        self
    }

    pub fn length(mut self, length: impl Into<String>) -> Self {
        self.length = Some(length.into());
        self
    }

    /// Title for display, falling back to "Untitled".
    pub fn display_title(&self) -> &str {
        let title = self.title.trim();
        if title.is_empty() {
            "Untitled"
        } else {
            title
        }
    }

    /// Set hint, ignoring blank strings.
    pub(crate) fn hint(value: &Option<String>) -> Option<&str> {
        value.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

/// Per-stage outcome carried in the final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageSummary {
    pub stage: Stage,
    pub score: f64,
    pub report: QualityReport,
    /// Refinement passes used (1 = accepted first time).
    pub refinement_attempts: u32,
    /// Whether the accepted candidate was the last one produced.
    pub accepted_latest: bool,
    pub using_cache: bool,
    pub met_threshold: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub genre: Option<String>,
    pub stages: Vec<StageSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub output: String,
    pub metadata: RunMetadata,
    pub metrics: Metrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_total() {
        let mut sorted = Stage::ALL;
        sorted.sort();
        assert_eq!(sorted, Stage::ALL);
        assert_eq!(Stage::Outliner.next(), Some(Stage::Writer));
        assert_eq!(Stage::Critic.next(), None);
        assert_eq!("Editor".parse::<Stage>().unwrap(), Stage::Editor);
        assert!("narrator".parse::<Stage>().is_err());
    }

    #[test]
    fn run_state_starts_with_every_stage_waiting() {
        let state = RunState::new(Uuid::new_v4(), 3);
        assert_eq!(state.stages.len(), 4);
        assert!(state
            .stages
            .values()
            .all(|p| p.status == StageStatus::Waiting && p.max_attempts == 3));
        assert_eq!(state.current_stage, None);
    }

    #[test]
    fn progress_serializes_camel_case() {
        let mut p = AgentProgress::waiting(Stage::Writer, 3);
        p.status = StageStatus::Retrying;
        p.backoff_delay = Some(2.0);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["status"], "retrying");
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["backoffDelay"], 2.0);
        assert_eq!(json["usingCache"], false);
    }

    #[test]
    fn request_needs_only_description() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"description":"a lonely lighthouse keeper"}"#).unwrap();
        assert_eq!(req.display_title(), "Untitled");
        assert_eq!(GenerationRequest::hint(&Some("  ".into())), None);
    }
}
