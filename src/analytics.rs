//! Per-stage pipeline analytics, built purely from published events.
//!
//! One [`Analytics`] aggregates over any number of runs: attach it to each
//! run's bus and it keeps a private observer per run.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::Serialize;

use crate::events::{EventBus, PipelineEvent, Subscription};
use crate::pipeline::{Stage, StageStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAnalytics {
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Backoff waits entered (one per failed attempt that was retried).
    pub retries: u64,
    pub refinements: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(skip)]
    initial_score_sum: f64,
    #[serde(skip)]
    final_score_sum: f64,
    #[serde(skip)]
    generation_ms_sum: u64,
}

impl StageAnalytics {
    /// Mean of the first score each completed run saw for this stage.
    pub fn initial_score(&self) -> Option<f64> {
        (self.successes > 0).then(|| self.initial_score_sum / self.successes as f64)
    }

    /// Mean accepted score.
    pub fn final_score(&self) -> Option<f64> {
        (self.successes > 0).then(|| self.final_score_sum / self.successes as f64)
    }

    /// `(final - initial) / initial * 100`; `None` without data or a zero baseline.
    pub fn improvement_rate(&self) -> Option<f64> {
        let initial = self.initial_score()?;
        let last = self.final_score()?;
        (initial > 0.0).then(|| (last - initial) / initial * 100.0)
    }

    pub fn average_generation_ms(&self) -> Option<f64> {
        (self.successes > 0).then(|| self.generation_ms_sum as f64 / self.successes as f64)
    }
}

/// Counters plus the derived per-stage figures, as exported.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    #[serde(flatten)]
    pub counters: StageAnalytics,
    pub initial_score: Option<f64>,
    pub final_score: Option<f64>,
    pub improvement_rate: Option<f64>,
    pub average_generation_ms: Option<f64>,
}

impl From<StageAnalytics> for StageReport {
    fn from(counters: StageAnalytics) -> Self {
        Self {
            initial_score: counters.initial_score(),
            final_score: counters.final_score(),
            improvement_rate: counters.improvement_rate(),
            average_generation_ms: counters.average_generation_ms(),
            counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsReport {
    pub stages: BTreeMap<Stage, StageReport>,
    pub cache_performance: CachePerformance,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachePerformance {
    pub hits: u64,
    pub misses: u64,
    pub total: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
}

#[derive(Clone, Default)]
pub struct Analytics {
    stages: Arc<Mutex<BTreeMap<Stage, StageAnalytics>>>,
}

impl Analytics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<Stage, StageAnalytics>> {
        self.stages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Observer for a single run's event sequence.
    pub fn observer(&self) -> RunObserver {
        RunObserver {
            analytics: self.clone(),
            started: HashMap::new(),
            initial: HashMap::new(),
        }
    }

    /// Feed every event of `bus` into a fresh run observer.
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let mut observer = self.observer();
        bus.subscribe_fn(move |event| observer.observe(&event))
    }

    pub fn stage(&self, stage: Stage) -> StageAnalytics {
        self.lock().get(&stage).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<Stage, StageAnalytics> {
        self.lock().clone()
    }

    /// Every stage seen so far plus run-wide cache performance.
    pub fn report(&self) -> AnalyticsReport {
        AnalyticsReport {
            stages: self
                .snapshot()
                .into_iter()
                .map(|(stage, counters)| (stage, counters.into()))
                .collect(),
            cache_performance: self.cache_performance(),
        }
    }

    pub fn cache_performance(&self) -> CachePerformance {
        let stages = self.lock();
        let hits: u64 = stages.values().map(|s| s.cache_hits).sum();
        let misses: u64 = stages.values().map(|s| s.cache_misses).sum();
        let total = hits + misses;
        let rate = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };
        CachePerformance {
            hits,
            misses,
            total,
            hit_rate: rate(hits),
            miss_rate: rate(misses),
        }
    }
}

pub struct RunObserver {
    analytics: Analytics,
    started: HashMap<Stage, Instant>,
    initial: HashMap<Stage, f64>,
}

impl RunObserver {
    pub fn observe(&mut self, event: &PipelineEvent) {
        let PipelineEvent::StageUpdate {
            stage,
            status,
            score,
            using_cache,
            ..
        } = event
        else {
            return;
        };
        let stage = *stage;

        if *status != StageStatus::Completed {
            if let Some(score) = score {
                self.initial.entry(stage).or_insert(*score);
            }
        }

        let mut stages = self.analytics.lock();
        let entry = stages.entry(stage).or_default();
        match status {
            StageStatus::Running => {
                self.started.entry(stage).or_insert_with(Instant::now);
            }
            StageStatus::Retrying => entry.retries += 1,
            StageStatus::Refining => entry.refinements += 1,
            StageStatus::Completed => {
                entry.successes += 1;
                if using_cache.unwrap_or(false) {
                    entry.cache_hits += 1;
                } else {
                    entry.cache_misses += 1;
                }
                let accepted = score.unwrap_or(0.0);
                entry.final_score_sum += accepted;
                entry.initial_score_sum += self.initial.get(&stage).copied().unwrap_or(accepted);
                if let Some(started) = self.started.get(&stage) {
                    entry.generation_ms_sum += started.elapsed().as_millis() as u64;
                }
            }
            StageStatus::Failed | StageStatus::Cancelled => entry.failures += 1,
            StageStatus::Waiting => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::AgentProgress;

    fn update(stage: Stage, status: StageStatus, score: Option<f64>, cached: bool) -> PipelineEvent {
        let mut p = AgentProgress::waiting(stage, 3);
        p.status = status;
        p.score = score;
        p.using_cache = cached;
        PipelineEvent::stage_update(&p)
    }

    #[test]
    fn counts_refinement_and_improvement() {
        let analytics = Analytics::new();
        let mut run = analytics.observer();
        for event in [
            update(Stage::Writer, StageStatus::Running, None, false),
            update(Stage::Writer, StageStatus::Running, Some(8.0), false),
            update(Stage::Writer, StageStatus::Refining, Some(8.0), false),
            update(Stage::Writer, StageStatus::Running, None, false),
            update(Stage::Writer, StageStatus::Retrying, None, false),
            update(Stage::Writer, StageStatus::Running, Some(9.6), false),
            update(Stage::Writer, StageStatus::Completed, Some(9.6), false),
        ] {
            run.observe(&event);
        }

        let writer = analytics.stage(Stage::Writer);
        assert_eq!(writer.refinements, 1);
        assert_eq!(writer.retries, 1);
        assert_eq!(writer.successes, 1);
        assert_eq!(writer.initial_score(), Some(8.0));
        assert_eq!(writer.final_score(), Some(9.6));
        let rate = writer.improvement_rate().unwrap();
        assert!((rate - 20.0).abs() < 1e-9);
    }

    #[test]
    fn cache_performance_spans_stages_and_runs() {
        let analytics = Analytics::new();
        analytics
            .observer()
            .observe(&update(Stage::Outliner, StageStatus::Completed, Some(9.7), false));
        analytics
            .observer()
            .observe(&update(Stage::Outliner, StageStatus::Completed, Some(9.7), true));
        analytics
            .observer()
            .observe(&update(Stage::Critic, StageStatus::Failed, None, false));

        let perf = analytics.cache_performance();
        assert_eq!(perf.hits, 1);
        assert_eq!(perf.misses, 1);
        assert_eq!(perf.total, 2);
        assert_eq!(perf.hit_rate, 0.5);
        assert_eq!(analytics.stage(Stage::Critic).failures, 1);
        assert_eq!(analytics.stage(Stage::Editor), StageAnalytics::default());
    }

    #[test]
    fn report_exports_derived_figures() {
        let analytics = Analytics::new();
        let mut run = analytics.observer();
        run.observe(&update(Stage::Writer, StageStatus::Running, Some(8.0), false));
        run.observe(&update(Stage::Writer, StageStatus::Completed, Some(9.6), false));

        let json = serde_json::to_value(analytics.report()).unwrap();
        let writer = &json["stages"]["writer"];
        assert_eq!(writer["successes"], 1);
        assert_eq!(writer["cacheMisses"], 1);
        assert_eq!(writer["initialScore"], 8.0);
        assert_eq!(writer["finalScore"], 9.6);
        assert!(writer.get("finalScoreSum").is_none());
        assert_eq!(json["cachePerformance"]["total"], 1);
    }
}
