#![forbid(unsafe_code)]

//! # quill-harness
//!
//! A quality-gated, multi-stage writing pipeline. A request flows through
//! four stages in a fixed order (outline, draft, edit, critique); each stage
//! is delegated to a model provider, retried with exponential backoff on
//! transient failure, memoised in a TTL cache, and refined until its output
//! clears a quality threshold or its refinement budget runs out.
//!
//! Runs publish every state transition on an [`EventBus`] so that UIs,
//! loggers and analytics can follow along without touching the run.

pub mod agent;
pub mod analytics;
pub mod cache;
pub mod evaluator;
pub mod events;
pub mod gateway;
pub mod pipeline;
pub mod prompts;
pub mod retry;
pub mod store;

pub use agent::{AgentBinding, AgentRoster, StageAgent, UnboundStage};
pub use analytics::{Analytics, AnalyticsReport, CachePerformance, StageAnalytics, StageReport};
pub use cache::{
    CacheEntry, CacheError, CacheKey, GenerationCache, MemoryGenerationCache,
    NullGenerationCache, SqliteGenerationCache,
};
pub use evaluator::{
    EvaluationError, HeuristicEvaluator, LlmEvaluator, QualityEvaluator, QualityReport,
    ScoringWeights,
};
pub use events::{EventBus, EventStream, JsonlEventSink, PipelineEvent, Subscription, TraceError};
pub use gateway::{
    AnthropicAdapter, ChatProvider, OpenAiAdapter, ProviderError, ProviderKind, ProviderSet,
    UsageSink,
};
pub use pipeline::{
    run_batch, AcceptancePolicy, FinalResult, GenerationRequest, GenerationRun, Metrics,
    Pipeline, PipelineConfig, PipelineError, RunHandle, RunState, Stage, StageStatus,
};
pub use retry::{with_retry, RetryError, RetryPolicy, Retryable};
pub use store::{GenerationRecord, RecordStore, SqliteRecordStore, StoreError};
