//! The per-run stage loop.
//!
//! Stages run strictly in order. Within a stage, each refinement pass renders
//! a prompt, consults the cache, calls the agent under retry on a miss, and
//! scores the candidate. A candidate at or above the threshold is accepted;
//! otherwise the stage refines from the most recent candidate until the pass
//! budget is spent, then keeps whichever candidate the acceptance policy picks.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentRoster, StageAgent};
use crate::cache::{CacheEntry, CacheKey, GenerationCache};
use crate::evaluator::{QualityEvaluator, QualityReport};
use crate::events::{EventBus, PipelineEvent};
use crate::gateway::ProviderError;
use crate::prompts::{template_for, RefinementContext};
use crate::retry::{with_retry, RetryAttempt, RetryError};

use super::config::{AcceptancePolicy, PipelineConfig};
use super::error::PipelineError;
use super::types::{
    AgentProgress, GenerationRequest, Metrics, RunState, Stage, StageStatus, StageSummary,
};

// =============================================================================
// Run state ownership
// =============================================================================

/// Read-only view of a run's state. Every read is a snapshot.
#[derive(Clone)]
pub struct RunStateView {
    inner: Arc<Mutex<RunState>>,
}

impl RunStateView {
    pub fn snapshot(&self) -> RunState {
        lock(&self.inner).clone()
    }
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sole writer of a run's [`RunState`]. Every change is published as it happens.
pub(crate) struct Tracker {
    state: Arc<Mutex<RunState>>,
    bus: EventBus,
}

impl Tracker {
    pub(crate) fn new(run_id: Uuid, max_attempts: u32, bus: EventBus) -> Self {
        Self {
            state: Arc::new(Mutex::new(RunState::new(run_id, max_attempts))),
            bus,
        }
    }

    pub(crate) fn view(&self) -> RunStateView {
        RunStateView {
            inner: self.state.clone(),
        }
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Mutate one stage's progress and publish the resulting snapshot.
    fn update(&self, stage: Stage, f: impl FnOnce(&mut AgentProgress)) {
        let mut state = lock(&self.state);
        let progress = state.stage_mut(stage);
        f(progress);
        // Published under the lock so observers see transitions in order.
        self.bus.publish(PipelineEvent::stage_update(progress));
    }

    fn enter(&self, stage: Stage) {
        lock(&self.state).current_stage = Some(stage);
    }

    /// Record an attempt starting; only a return from `retrying` is an event.
    fn begin_attempt(&self, stage: Stage, attempt: u32) {
        let mut state = lock(&self.state);
        let progress = state.stage_mut(stage);
        progress.attempt = attempt;
        if progress.status == StageStatus::Retrying {
            progress.status = StageStatus::Running;
            progress.backoff_delay = None;
            self.bus.publish(PipelineEvent::stage_update(progress));
        }
    }

    fn set_metrics(&self, metrics: Metrics) {
        let mut state = lock(&self.state);
        state.metrics = metrics;
        self.bus.publish(PipelineEvent::MetricsUpdate(metrics));
    }
}

// =============================================================================
// Sequencer
// =============================================================================

pub(crate) struct SequenceOutput {
    pub output: String,
    pub stages: Vec<StageSummary>,
    pub metrics: Metrics,
}

#[derive(Clone)]
struct Candidate {
    prompt: String,
    output: String,
    report: QualityReport,
    from_cache: bool,
    pass: u32,
}

pub(crate) struct Sequencer<'a> {
    pub run_id: Uuid,
    pub request: &'a GenerationRequest,
    pub config: &'a PipelineConfig,
    pub agents: &'a AgentRoster,
    pub cache: &'a dyn GenerationCache,
    pub evaluator: &'a dyn QualityEvaluator,
    pub cancel: &'a CancellationToken,
    pub tracker: &'a Tracker,
}

impl Sequencer<'_> {
    pub(crate) async fn run(&self) -> Result<SequenceOutput, PipelineError> {
        let mut upstream: Option<String> = None;
        let mut stages = Vec::with_capacity(Stage::ALL.len());
        let mut scores = BTreeMap::new();
        let mut metrics = Metrics::default();

        for stage in Stage::ALL {
            self.tracker.enter(stage);
            let result = match self.agents.get(stage) {
                Ok(agent) => self.run_stage(stage, agent, upstream.as_deref()).await,
                Err(unbound) => Err(unbound.into()),
            };
            let (output, summary) = match result {
                Ok(accepted) => accepted,
                Err(err) => {
                    let status = if err.is_cancelled() {
                        StageStatus::Cancelled
                    } else {
                        StageStatus::Failed
                    };
                    self.tracker.update(stage, |p| {
                        p.status = status;
                        p.backoff_delay = None;
                    });
                    tracing::warn!(run_id = %self.run_id, %stage, error = %err, "stage failed");
                    return Err(err);
                }
            };

            scores.insert(stage, summary.score);
            metrics = aggregate_metrics(&scores);
            self.tracker.set_metrics(metrics);
            stages.push(summary);
            upstream = Some(output);
        }

        Ok(SequenceOutput {
            output: upstream.unwrap_or_default(),
            stages,
            metrics,
        })
    }

    async fn run_stage(
        &self,
        stage: Stage,
        agent: &StageAgent,
        upstream: Option<&str>,
    ) -> Result<(String, StageSummary), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Some(stage) });
        }
        let started = tokio::time::Instant::now();
        let template = template_for(stage);
        let threshold = self.config.quality_threshold;
        let budget = self.config.max_refinement_attempts.max(1);

        self.tracker.bus().publish(PipelineEvent::progress(stage, stage_message(stage)));
        tracing::info!(run_id = %self.run_id, %stage, "stage started");

        let mut previous: Option<Candidate> = None;
        let mut best: Option<Candidate> = None;
        let mut pass = 1;

        loop {
            self.tracker.update(stage, |p| {
                p.status = StageStatus::Running;
                p.progress = 10;
                p.attempt = 0;
                p.backoff_delay = None;
                p.using_cache = false;
                p.refinement_attempt = pass;
            });

            let deficiencies = previous
                .as_ref()
                .map(|c| c.report.deficiencies(threshold))
                .unwrap_or_default();
            let refinement = previous.as_ref().map(|c| RefinementContext {
                attempt: pass,
                previous: &c.output,
                previous_score: c.report.overall,
                deficiencies: &deficiencies,
            });
            let prompt = template
                .render(self.request, upstream, refinement.as_ref())
                .user;

            let (output, from_cache) = match self.cached(stage, &prompt).await {
                Some(entry) => {
                    self.tracker.update(stage, |p| {
                        p.using_cache = true;
                        p.progress = 50;
                    });
                    (entry.output, true)
                }
                None => (self.generate(stage, agent, &prompt).await?, false),
            };

            self.tracker.update(stage, |p| {
                p.output = Some(output.clone());
                p.progress = 70;
            });

            let report = self.evaluate(stage, &output).await?;
            let composite = report.overall;
            let score = report.score();
            tracing::info!(run_id = %self.run_id, %stage, pass, score, from_cache, "candidate scored");
            self.tracker.update(stage, |p| {
                p.score = Some(score);
                p.progress = 90;
            });

            let candidate = Candidate {
                prompt,
                output,
                report,
                from_cache,
                pass,
            };
            if best
                .as_ref()
                .map_or(true, |b| composite > b.report.overall)
            {
                best = Some(candidate.clone());
            }

            let met_threshold = composite >= threshold;
            if met_threshold || pass >= budget {
                let accepted = match (met_threshold, self.config.acceptance) {
                    (true, _) | (false, AcceptancePolicy::MostRecent) => candidate,
                    (false, AcceptancePolicy::BestSeen) => best.unwrap_or(candidate),
                };
                let accepted_latest = accepted.pass == pass;
                return self
                    .accept(stage, accepted, pass, accepted_latest, met_threshold, started)
                    .await;
            }

            tracing::info!(run_id = %self.run_id, %stage, pass, score, threshold, "refining");
            self.tracker.update(stage, |p| {
                p.status = StageStatus::Refining;
                p.progress = 50;
                p.refinement_attempt = pass + 1;
            });
            previous = Some(candidate);
            pass += 1;
        }
    }

    async fn accept(
        &self,
        stage: Stage,
        accepted: Candidate,
        passes: u32,
        accepted_latest: bool,
        met_threshold: bool,
        started: tokio::time::Instant,
    ) -> Result<(String, StageSummary), PipelineError> {
        if self.cancel.is_cancelled() {
            return Err(PipelineError::Cancelled { stage: Some(stage) });
        }
        let score = accepted.report.score();
        if !accepted.from_cache {
            self.remember(stage, &accepted).await;
        }

        self.tracker.update(stage, |p| {
            p.status = StageStatus::Completed;
            p.progress = 100;
            p.output = Some(accepted.output.clone());
            p.score = Some(score);
            p.using_cache = accepted.from_cache;
            p.backoff_delay = None;
        });
        tracing::info!(run_id = %self.run_id, %stage, score, passes, met_threshold, "stage completed");

        let summary = StageSummary {
            stage,
            score,
            report: accepted.report,
            refinement_attempts: passes,
            accepted_latest,
            using_cache: accepted.from_cache,
            met_threshold,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        Ok((accepted.output, summary))
    }

    /// Cache lookup. Any cache failure is a miss.
    async fn cached(&self, stage: Stage, prompt: &str) -> Option<CacheEntry> {
        let key = CacheKey::new(stage, prompt);
        match self.cache.lookup(&key).await {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(run_id = %self.run_id, %stage, error = %err, "cache lookup failed");
                self.tracker.bus().publish(PipelineEvent::warning(
                    Some(stage),
                    format!("cache unavailable, treating as miss: {err}"),
                ));
                None
            }
        }
    }

    async fn remember(&self, stage: Stage, candidate: &Candidate) {
        let key = CacheKey::new(stage, &candidate.prompt);
        if let Err(err) = self
            .cache
            .store(&key, &candidate.output, candidate.report.overall)
            .await
        {
            tracing::warn!(run_id = %self.run_id, %stage, error = %err, "cache write failed");
            self.tracker.bus().publish(PipelineEvent::warning(
                Some(stage),
                format!("cache write skipped: {err}"),
            ));
        }
    }

    async fn generate(
        &self,
        stage: Stage,
        agent: &StageAgent,
        prompt: &str,
    ) -> Result<String, PipelineError> {
        let timeout = self.config.stage_timeout();
        let run_id = self.run_id;
        let tracker = self.tracker;

        let result = with_retry(
            &self.config.retry,
            self.cancel,
            |retry: &RetryAttempt<'_, ProviderError>| {
                tracing::warn!(
                    run_id = %run_id,
                    %stage,
                    attempt = retry.attempt,
                    delay_ms = retry.delay.as_millis() as u64,
                    error = %retry.error,
                    "agent call failed, backing off"
                );
                let delay = retry.delay.as_secs_f64();
                tracker.update(stage, |p| {
                    p.status = StageStatus::Retrying;
                    p.attempt = retry.attempt;
                    p.backoff_delay = Some(delay);
                });
            },
            |attempt| {
                tracker.begin_attempt(stage, attempt);
                let call = agent.generate(prompt, Some(run_id));
                async move {
                    match timeout {
                        Some(limit) => tokio::time::timeout(limit, call)
                            .await
                            .unwrap_or_else(|_| Err(ProviderError::Timeout(limit, None))),
                        None => call.await,
                    }
                }
            },
        )
        .await;

        result.map_err(|err| match err {
            RetryError::Cancelled { .. } => PipelineError::Cancelled { stage: Some(stage) },
            RetryError::Exhausted { attempts, last } => PipelineError::Agent {
                stage,
                attempts,
                source: last,
            },
            RetryError::Fatal { attempt, error } => PipelineError::Agent {
                stage,
                attempts: attempt,
                source: error,
            },
        })
    }

    async fn evaluate(&self, stage: Stage, output: &str) -> Result<QualityReport, PipelineError> {
        let run_id = self.run_id;
        let result = with_retry(
            &self.config.retry,
            self.cancel,
            |retry: &RetryAttempt<'_, _>| {
                tracing::warn!(
                    run_id = %run_id,
                    %stage,
                    attempt = retry.attempt,
                    error = %retry.error,
                    "evaluation failed, backing off"
                );
            },
            |_| self.evaluator.evaluate(stage, output),
        )
        .await;

        result.map_err(|err| match err {
            RetryError::Cancelled { .. } => PipelineError::Cancelled { stage: Some(stage) },
            RetryError::Exhausted { last, .. } => PipelineError::Evaluation {
                stage,
                source: last,
            },
            RetryError::Fatal { error, .. } => PipelineError::Evaluation {
                stage,
                source: error,
            },
        })
    }
}

fn stage_message(stage: Stage) -> &'static str {
    match stage {
        Stage::Outliner => "Creating story outline...",
        Stage::Writer => "Generating initial draft...",
        Stage::Editor => "Enhancing dialogues and pacing...",
        Stage::Critic => "Final review and polish...",
    }
}

/// Structure from the outline, writing quality from the draft, technical
/// aspects from the edit; overall is the mean of every accepted stage.
pub(crate) fn aggregate_metrics(scores: &BTreeMap<Stage, f64>) -> Metrics {
    let get = |stage| scores.get(&stage).copied().unwrap_or(0.0);
    let overall = if scores.is_empty() {
        0.0
    } else {
        scores.values().sum::<f64>() / scores.len() as f64
    };
    Metrics {
        structure: get(Stage::Outliner),
        writing_quality: get(Stage::Writer),
        technical_aspects: get(Stage::Editor),
        overall: (overall * 100.0).round() / 100.0,
    }
}
