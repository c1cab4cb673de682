//! Generation pipeline.
//!
//! A [`Pipeline`] holds the injected collaborators (agents, cache, evaluator,
//! record store) and configuration. Each request becomes a [`GenerationRun`]
//! with its own run state, event bus and cancellation token; runs share
//! nothing mutable except the cache.

pub mod config;
pub mod error;
mod sequencer;
pub mod types;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::AgentRoster;
use crate::analytics::Analytics;
use crate::cache::GenerationCache;
use crate::evaluator::{HeuristicEvaluator, LlmEvaluator, QualityEvaluator};
use crate::events::{EventBus, EventStream, PipelineEvent, Subscription};
use crate::gateway::{ProviderSet, UsageSink};
use crate::store::{RecordStatus, RecordStore, RecordUpdate};

pub use config::{AcceptancePolicy, ConfigError, EvaluatorKind, PipelineConfig};
pub use error::{FailureKind, PipelineError};
pub use sequencer::RunStateView;
pub use types::{
    AgentProgress, FinalResult, GenerationRequest, Metrics, RunMetadata, RunState, Stage,
    StageStatus, StageSummary, UnknownStage,
};

use sequencer::{Sequencer, Tracker};

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    agents: Arc<AgentRoster>,
    cache: Arc<dyn GenerationCache>,
    evaluator: Arc<dyn QualityEvaluator>,
    store: Option<Arc<dyn RecordStore>>,
    analytics: Option<Analytics>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        agents: AgentRoster,
        cache: Arc<dyn GenerationCache>,
        evaluator: Arc<dyn QualityEvaluator>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            agents: Arc::new(agents),
            cache,
            evaluator,
            store: None,
            analytics: None,
        })
    }

    /// Wire agents and the evaluator from `config` against real providers.
    pub fn from_providers(
        config: PipelineConfig,
        providers: &ProviderSet,
        cache: Arc<dyn GenerationCache>,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let agents = AgentRoster::from_bindings(&config.bindings, providers, usage_sink)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let evaluator: Arc<dyn QualityEvaluator> = match config.evaluator {
            EvaluatorKind::Heuristic => Arc::new(
                HeuristicEvaluator::new(config.weights)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            ),
            EvaluatorKind::Llm => {
                let judge = providers
                    .get(config.judge.provider)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?;
                Arc::new(
                    LlmEvaluator::new(judge, config.judge.chat_model(), config.weights)
                        .map_err(|e| ConfigError::Invalid(e.to_string()))?
                        .temperature(config.judge.temperature),
                )
            }
        };
        Self::new(config, agents, cache, evaluator)
    }

    pub fn with_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Aggregate every run's events into `analytics`. Each run waits for the
    /// aggregation to drain before it returns.
    pub fn with_analytics(mut self, analytics: Analytics) -> Self {
        self.analytics = Some(analytics);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Validate `request` and set up a run without starting it, so callers
    /// can subscribe before the first event.
    pub fn prepare(&self, request: GenerationRequest) -> Result<GenerationRun, PipelineError> {
        if request.description.trim().is_empty() {
            return Err(PipelineError::InvalidRequest(
                "description must not be empty".into(),
            ));
        }
        let run_id = Uuid::new_v4();
        let bus = EventBus::new();
        let tracker = Tracker::new(run_id, self.config.retry.max_attempts.max(1), bus);
        Ok(GenerationRun {
            pipeline: self.clone(),
            request,
            run_id,
            cancel: CancellationToken::new(),
            tracker,
        })
    }

    pub async fn run(&self, request: GenerationRequest) -> Result<FinalResult, PipelineError> {
        self.prepare(request)?.execute().await
    }
}

/// Cancels one run.
#[derive(Clone)]
pub struct RunStopper {
    token: CancellationToken,
}

impl RunStopper {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// One prepared run.
pub struct GenerationRun {
    pipeline: Pipeline,
    request: GenerationRequest,
    run_id: Uuid,
    cancel: CancellationToken,
    tracker: Tracker,
}

impl GenerationRun {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.request
    }

    pub fn subscribe(&self) -> EventStream {
        self.tracker.bus().subscribe()
    }

    pub fn subscribe_fn<F>(&self, handler: F) -> Subscription
    where
        F: FnMut(PipelineEvent) + Send + 'static,
    {
        self.tracker.bus().subscribe_fn(handler)
    }

    pub fn events(&self) -> &EventBus {
        self.tracker.bus()
    }

    pub fn stopper(&self) -> RunStopper {
        RunStopper {
            token: self.cancel.clone(),
        }
    }

    pub fn state(&self) -> RunStateView {
        self.tracker.view()
    }

    /// Run every stage to completion, failure or cancellation. The event bus
    /// is closed when this returns.
    pub async fn execute(self) -> Result<FinalResult, PipelineError> {
        let started_at = Utc::now();
        let clock = Instant::now();
        let bus = self.tracker.bus().clone();
        tracing::info!(
            run_id = %self.run_id,
            title = self.request.display_title(),
            "run started"
        );

        let observed = self.pipeline.analytics.as_ref().map(|a| a.attach(&bus));
        let record_id = self.persist_start().await;

        let sequencer = Sequencer {
            run_id: self.run_id,
            request: &self.request,
            config: &self.pipeline.config,
            agents: &self.pipeline.agents,
            cache: self.pipeline.cache.as_ref(),
            evaluator: self.pipeline.evaluator.as_ref(),
            cancel: &self.cancel,
            tracker: &self.tracker,
        };

        let result = match sequencer.run().await {
            Ok(done) => {
                if let Some(id) = record_id {
                    self.persist(
                        id,
                        RecordUpdate::completed(
                            done.output.clone(),
                            done.metrics,
                            done.stages.clone(),
                        ),
                    )
                    .await;
                }
                let metadata = RunMetadata {
                    run_id: self.run_id,
                    title: self.request.display_title().to_string(),
                    genre: self.request.genre.clone(),
                    stages: done.stages,
                    record_id,
                    started_at,
                    finished_at: Utc::now(),
                    duration_ms: clock.elapsed().as_millis() as u64,
                };
                tracing::info!(
                    run_id = %self.run_id,
                    overall = done.metrics.overall,
                    duration_ms = metadata.duration_ms,
                    "run completed"
                );
                bus.publish(PipelineEvent::Complete {
                    output: done.output.clone(),
                    metrics: done.metrics,
                });
                bus.close();
                Ok(FinalResult {
                    output: done.output,
                    metadata,
                    metrics: done.metrics,
                })
            }
            Err(err) => {
                if let Some(id) = record_id {
                    self.persist(id, RecordUpdate::failed(err.to_string())).await;
                }
                tracing::warn!(
                    run_id = %self.run_id,
                    kind = err.kind().as_str(),
                    error = %err,
                    "run failed"
                );
                bus.publish(PipelineEvent::Error {
                    stage: err.stage(),
                    kind: err.kind(),
                    error: err.to_string(),
                });
                bus.close();
                Err(err)
            }
        };
        if let Some(subscription) = observed {
            subscription.finished().await;
        }
        result
    }

    /// Execute on a background task.
    pub fn spawn(self) -> RunHandle {
        let run_id = self.run_id;
        let stopper = self.stopper();
        let state = self.state();
        let task = tokio::spawn(self.execute());
        RunHandle {
            run_id,
            stopper,
            state,
            task,
        }
    }

    async fn persist_start(&self) -> Option<i64> {
        let store = self.pipeline.store.as_ref()?;
        match store.create(&self.request, RecordStatus::Generating).await {
            Ok(id) => Some(id),
            Err(err) => {
                self.persistence_failed(&err.to_string());
                None
            }
        }
    }

    async fn persist(&self, id: i64, update: RecordUpdate) {
        let Some(store) = self.pipeline.store.as_ref() else {
            return;
        };
        if let Err(err) = store.update(id, update).await {
            self.persistence_failed(&err.to_string());
        }
    }

    fn persistence_failed(&self, error: &str) {
        tracing::warn!(run_id = %self.run_id, error, "record store failed");
        self.tracker.bus().publish(PipelineEvent::warning(
            None,
            format!("persistence failed: {error}"),
        ));
    }
}

/// A run executing on a background task.
pub struct RunHandle {
    run_id: Uuid,
    stopper: RunStopper,
    state: RunStateView,
    task: tokio::task::JoinHandle<Result<FinalResult, PipelineError>>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Abort the active stage. The run ends with a cancelled stage and an
    /// `error` event; no cache writes or agent calls follow.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    pub fn stopper(&self) -> RunStopper {
        self.stopper.clone()
    }

    pub fn state(&self) -> RunState {
        self.state.snapshot()
    }

    pub async fn join(self) -> Result<FinalResult, PipelineError> {
        self.task
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))?
    }
}

/// Run independent requests with at most `parallel` in flight. Results come
/// back in request order.
pub async fn run_batch(
    pipeline: &Pipeline,
    requests: Vec<GenerationRequest>,
    parallel: usize,
) -> Vec<Result<FinalResult, PipelineError>> {
    let total = requests.len();
    let futures = requests.into_iter().enumerate().map(|(idx, request)| {
        let pipeline = pipeline.clone();
        async move {
            let result = pipeline.run(request).await;
            match &result {
                Ok(done) => tracing::info!(
                    index = idx + 1,
                    total,
                    overall = done.metrics.overall,
                    "batch item completed"
                ),
                Err(err) => tracing::warn!(index = idx + 1, total, error = %err, "batch item failed"),
            }
            (idx, result)
        }
    });

    let mut results: Vec<_> = stream::iter(futures)
        .buffer_unordered(parallel.max(1))
        .collect()
        .await;
    results.sort_by_key(|(idx, _)| *idx);
    results.into_iter().map(|(_, result)| result).collect()
}
