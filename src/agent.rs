//! Stage agents: a stage bound to one provider, model and system instruction.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::gateway::{
    Attribution, ChatModel, ChatProvider, ChatRequest, Message, NoopUsageSink, ProviderCallRecord,
    ProviderError, ProviderKind, ProviderSet, UsageSink,
};
use crate::pipeline::Stage;
use crate::prompts::template_for;

fn default_temperature() -> f32 {
    0.7
}

/// How one stage talks to its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentBinding {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Overrides the stage's built-in system instruction.
    #[serde(default)]
    pub system: Option<String>,
}

impl AgentBinding {
    pub fn new(provider: ProviderKind, model: impl Into<String>, temperature: f32) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            max_tokens: None,
            system: None,
        }
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn system(mut self, instruction: impl Into<String>) -> Self {
        self.system = Some(instruction.into());
        self
    }

    pub fn default_for(stage: Stage) -> Self {
        match stage {
            Stage::Outliner => Self::new(ProviderKind::OpenAi, "gpt-4", 0.7).max_tokens(2_048),
            Stage::Writer => {
                Self::new(ProviderKind::Anthropic, "claude-3-opus-20240229", 0.8).max_tokens(4_096)
            }
            Stage::Editor => Self::new(ProviderKind::OpenAi, "gpt-4", 0.3).max_tokens(4_096),
            Stage::Critic => {
                Self::new(ProviderKind::Anthropic, "claude-3-opus-20240229", 0.3).max_tokens(4_096)
            }
        }
    }

    pub fn defaults() -> BTreeMap<Stage, AgentBinding> {
        Stage::ALL
            .iter()
            .map(|&stage| (stage, Self::default_for(stage)))
            .collect()
    }

    pub fn chat_model(&self) -> ChatModel {
        ChatModel::new(self.provider, self.model.clone())
    }
}

/// A stage with no agent bound to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no agent bound to stage {0}")]
pub struct UnboundStage(pub Stage);

/// The agent for one stage.
pub struct StageAgent {
    stage: Stage,
    provider: Arc<dyn ChatProvider>,
    binding: AgentBinding,
    instruction: String,
    usage_sink: Arc<dyn UsageSink>,
}

impl StageAgent {
    pub fn new(stage: Stage, provider: Arc<dyn ChatProvider>, binding: AgentBinding) -> Self {
        let instruction = binding
            .system
            .clone()
            .unwrap_or_else(|| template_for(stage).system.to_string());
        Self {
            stage,
            provider,
            binding,
            instruction,
            usage_sink: Arc::new(NoopUsageSink),
        }
    }

    pub fn with_usage_sink(mut self, sink: Arc<dyn UsageSink>) -> Self {
        self.usage_sink = sink;
        self
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn binding(&self) -> &AgentBinding {
        &self.binding
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    /// One provider call: `[system(instruction), user(prompt)]` under this binding.
    pub async fn generate(&self, prompt: &str, run_id: Option<Uuid>) -> Result<String, ProviderError> {
        let mut attribution = Attribution::new("agent::generate").with_stage(self.stage.as_str());
        attribution.run_id = run_id;

        let mut req = ChatRequest::new(
            self.binding.chat_model(),
            vec![Message::system(&self.instruction), Message::user(prompt)],
            attribution,
        )
        .temperature(self.binding.temperature);
        if let Some(max) = self.binding.max_tokens {
            req = req.max_tokens(max);
        }

        let started = std::time::Instant::now();
        let result = self.provider.chat(&req).await;

        let record = ProviderCallRecord::new(
            req.model.provider(),
            req.model.model_id(),
            req.attribution.caller,
        )
        .run(req.attribution.run_id)
        .stage(req.attribution.stage);

        match result {
            Ok(resp) => {
                let record = record
                    .tokens(resp.input_tokens, resp.output_tokens)
                    .latency(resp.latency.as_millis() as u64)
                    .request_id(resp.request_id.clone());
                self.usage_sink.record(record).await;
                Ok(resp.content)
            }
            Err(err) => {
                let record = record
                    .latency(started.elapsed().as_millis() as u64)
                    .request_id(err.request_id().map(str::to_string))
                    .error(err.code());
                self.usage_sink.record(record).await;
                Err(err)
            }
        }
    }
}

/// Explicit stage -> agent lookup.
#[derive(Default)]
pub struct AgentRoster {
    agents: HashMap<Stage, StageAgent>,
}

impl AgentRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent: StageAgent) -> Self {
        self.insert(agent);
        self
    }

    pub fn insert(&mut self, agent: StageAgent) {
        self.agents.insert(agent.stage(), agent);
    }

    pub fn get(&self, stage: Stage) -> Result<&StageAgent, UnboundStage> {
        self.agents.get(&stage).ok_or(UnboundStage(stage))
    }

    /// Bind every stage to the same provider.
    pub fn uniform(provider: Arc<dyn ChatProvider>, bindings: &BTreeMap<Stage, AgentBinding>) -> Self {
        let mut roster = Self::new();
        for (&stage, binding) in bindings {
            roster.insert(StageAgent::new(stage, provider.clone(), binding.clone()));
        }
        roster
    }

    /// Bind each stage to the provider its binding names.
    pub fn from_bindings(
        bindings: &BTreeMap<Stage, AgentBinding>,
        providers: &ProviderSet,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self, ProviderError> {
        let mut roster = Self::new();
        for (&stage, binding) in bindings {
            let provider = providers.get(binding.provider)?;
            roster.insert(
                StageAgent::new(stage, provider, binding.clone())
                    .with_usage_sink(usage_sink.clone()),
            );
        }
        Ok(roster)
    }

    pub fn stages(&self) -> impl Iterator<Item = Stage> + '_ {
        self.agents.keys().copied()
    }
}
