//! Progress events and the per-run event bus.
//!
//! Every subscriber owns an unbounded channel, so `publish` never waits on a
//! slow consumer and each subscriber sees events in emission order. The bus
//! keeps the latest `stageUpdate` per stage, the latest `metricsUpdate` and
//! the terminal event, and replays them to anyone who subscribes late.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::pin::Pin;
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::pipeline::{AgentProgress, FailureKind, Metrics, Stage, StageStatus};

// =============================================================================
// Event schema
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum PipelineEvent {
    Progress {
        stage: Stage,
        message: String,
    },
    StageUpdate {
        stage: Stage,
        status: StageStatus,
        progress: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_attempts: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        backoff_delay: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        using_cache: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refinement_attempt: Option<u32>,
    },
    MetricsUpdate(Metrics),
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        kind: FailureKind,
        error: String,
    },
    Complete {
        output: String,
        metrics: Metrics,
    },
    Warning {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stage: Option<Stage>,
        message: String,
    },
}

impl PipelineEvent {
    pub fn progress(stage: Stage, message: impl Into<String>) -> Self {
        Self::Progress {
            stage,
            message: message.into(),
        }
    }

    /// Snapshot of one stage's progress record.
    pub fn stage_update(p: &AgentProgress) -> Self {
        Self::StageUpdate {
            stage: p.stage,
            status: p.status,
            progress: p.progress,
            score: p.score,
            attempt: (p.attempt > 0).then_some(p.attempt),
            max_attempts: Some(p.max_attempts),
            backoff_delay: p.backoff_delay,
            using_cache: Some(p.using_cache),
            refinement_attempt: (p.refinement_attempt > 0).then_some(p.refinement_attempt),
        }
    }

    pub fn warning(stage: Option<Stage>, message: impl Into<String>) -> Self {
        Self::Warning {
            stage,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Progress { .. } => "progress",
            Self::StageUpdate { .. } => "stageUpdate",
            Self::MetricsUpdate(_) => "metricsUpdate",
            Self::Error { .. } => "error",
            Self::Complete { .. } => "complete",
            Self::Warning { .. } => "warning",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Progress { stage, .. } | Self::StageUpdate { stage, .. } => Some(*stage),
            Self::Error { stage, .. } | Self::Warning { stage, .. } => *stage,
            Self::MetricsUpdate(_) | Self::Complete { .. } => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Frame as a server-sent event: `data: <json>\n\n`.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

// =============================================================================
// Bus
// =============================================================================

#[derive(Default)]
struct BusInner {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<PipelineEvent>)>,
    last_stage: BTreeMap<Stage, PipelineEvent>,
    last_metrics: Option<PipelineEvent>,
    terminal: Option<PipelineEvent>,
    closed: bool,
}

impl BusInner {
    fn replay(&self) -> Vec<PipelineEvent> {
        let mut events: Vec<PipelineEvent> = self.last_stage.values().cloned().collect();
        events.extend(self.last_metrics.iter().cloned());
        events.extend(self.terminal.iter().cloned());
        events
    }
}

/// Fan-out of one run's events. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deliver `event` to every live subscriber. Ignored once the bus is closed.
    pub fn publish(&self, event: PipelineEvent) {
        let mut inner = self.lock();
        if inner.closed {
            tracing::debug!(kind = event.kind(), "event published after close dropped");
            return;
        }
        match &event {
            PipelineEvent::StageUpdate { stage, .. } => {
                inner.last_stage.insert(*stage, event.clone());
            }
            PipelineEvent::MetricsUpdate(_) => inner.last_metrics = Some(event.clone()),
            PipelineEvent::Complete { .. } | PipelineEvent::Error { .. } => {
                inner.terminal = Some(event.clone())
            }
            _ => {}
        }
        // A failed send means the receiver is gone; forget it.
        inner
            .subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    /// New ordered stream of events, starting with the replayed last values.
    /// Replayed stage updates come in stage order, not emission order; only
    /// live events reflect the order transitions happened in.
    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        for event in inner.replay() {
            let _ = tx.send(event);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.push((id, tx));
        }
        EventStream { rx }
    }

    /// Run `handler` for every event on its own task. Requires a Tokio runtime.
    pub fn subscribe_fn<F>(&self, mut handler: F) -> Subscription
    where
        F: FnMut(PipelineEvent) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = {
            let mut inner = self.lock();
            for event in inner.replay() {
                let _ = tx.send(event);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            if !inner.closed {
                inner.subscribers.push((id, tx));
            }
            id
        };
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                handler(event);
            }
        });
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            task,
        }
    }

    /// Stop accepting events and end every subscriber's stream once drained.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Ordered receiver of one subscriber's events. Ends when the bus closes.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
}

impl EventStream {
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<PipelineEvent> {
        self.rx.try_recv().ok()
    }

    /// Drain until the bus closes.
    pub async fn collect_all(mut self) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for EventStream {
    type Item = PipelineEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Handle for a callback subscription.
pub struct Subscription {
    id: u64,
    bus: Weak<Mutex<BusInner>>,
    task: tokio::task::JoinHandle<()>,
}

impl Subscription {
    /// Stop delivery. Events already queued for the handler are still handled.
    pub fn unsubscribe(self) -> tokio::task::JoinHandle<()> {
        if let Some(inner) = self.bus.upgrade() {
            let mut inner = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            inner.subscribers.retain(|(id, _)| *id != self.id);
        }
        self.task
    }

    /// Wait for the handler task to finish (after unsubscribe or bus close).
    pub async fn finished(self) {
        let _ = self.task.await;
    }
}

// =============================================================================
// JSONL sink
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("event channel closed")]
    Closed,
    #[error("event writer failed: {0}")]
    Join(String),
}

/// One JSON line per event, written on a dedicated thread.
#[derive(Clone)]
pub struct JsonlEventSink {
    sender: std_mpsc::Sender<PipelineEvent>,
}

pub struct EventWriter {
    handle: Option<std::thread::JoinHandle<Result<usize, TraceError>>>,
}

impl EventWriter {
    /// Wait for the writer to flush. Returns the number of lines written.
    pub fn join(mut self) -> Result<usize, TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("event writer panicked".to_string())),
            },
            None => Ok(0),
        }
    }
}

impl JsonlEventSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, EventWriter), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = std_mpsc::channel::<PipelineEvent>();
        let handle = std::thread::spawn(move || write_event_loop(file, receiver));
        Ok((
            Self { sender },
            EventWriter {
                handle: Some(handle),
            },
        ))
    }

    pub fn record(&self, event: PipelineEvent) -> Result<(), TraceError> {
        self.sender.send(event).map_err(|_| TraceError::Closed)
    }

    /// Forward every event from `bus` until it closes.
    pub fn attach(self, bus: &EventBus) -> Subscription {
        bus.subscribe_fn(move |event| {
            if let Err(err) = self.record(event) {
                tracing::warn!(error = %err, "dropping event for jsonl sink");
            }
        })
    }
}

fn write_event_loop(
    file: std::fs::File,
    receiver: std_mpsc::Receiver<PipelineEvent>,
) -> Result<usize, TraceError> {
    let mut writer = BufWriter::new(file);
    let mut written = 0;
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(stage: Stage, status: StageStatus) -> PipelineEvent {
        let mut p = AgentProgress::waiting(stage, 3);
        p.status = status;
        PipelineEvent::stage_update(&p)
    }

    #[test]
    fn events_serialize_with_type_tag_and_camel_case() {
        let mut p = AgentProgress::waiting(Stage::Writer, 3);
        p.status = StageStatus::Retrying;
        p.attempt = 1;
        p.backoff_delay = Some(1.0);
        let json = serde_json::to_value(PipelineEvent::stage_update(&p)).unwrap();
        assert_eq!(json["type"], "stageUpdate");
        assert_eq!(json["stage"], "writer");
        assert_eq!(json["maxAttempts"], 3);
        assert_eq!(json["backoffDelay"], 1.0);

        let metrics = PipelineEvent::MetricsUpdate(Metrics {
            structure: 9.6,
            ..Default::default()
        });
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["type"], "metricsUpdate");
        assert_eq!(json["structure"], 9.6);
        assert_eq!(json["writingQuality"], 0.0);

        let err = PipelineEvent::Error {
            stage: Some(Stage::Editor),
            kind: FailureKind::Transient,
            error: "boom".into(),
        };
        let back: PipelineEvent =
            serde_json::from_str(&serde_json::to_string(&err).unwrap()).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn sse_framing() {
        let frame = PipelineEvent::progress(Stage::Outliner, "Creating story outline...")
            .to_sse()
            .unwrap();
        assert!(frame.starts_with("data: {\"type\":\"progress\""));
        assert!(frame.ends_with("\n\n"));
    }

    #[tokio::test]
    async fn subscribers_see_identical_ordered_streams() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        for stage in Stage::ALL {
            bus.publish(PipelineEvent::progress(stage, stage.as_str()));
        }
        bus.close();
        let a = a.collect_all().await;
        let b = b.collect_all().await;
        assert_eq!(a.len(), 4);
        assert_eq!(a, b);
        assert_eq!(a[0].stage(), Some(Stage::Outliner));
        assert_eq!(a[3].stage(), Some(Stage::Critic));
    }

    #[tokio::test]
    async fn late_subscriber_gets_last_values_and_terminal() {
        let bus = EventBus::new();
        bus.publish(update(Stage::Outliner, StageStatus::Running));
        bus.publish(update(Stage::Outliner, StageStatus::Completed));
        bus.publish(PipelineEvent::progress(Stage::Writer, "not replayed"));
        bus.publish(PipelineEvent::Complete {
            output: "fin".into(),
            metrics: Metrics::default(),
        });
        bus.close();

        let replay = bus.subscribe().collect_all().await;
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0], update(Stage::Outliner, StageStatus::Completed));
        assert!(replay[1].is_terminal());
    }

    #[tokio::test]
    async fn publish_after_close_is_dropped() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        bus.close();
        bus.publish(PipelineEvent::progress(Stage::Writer, "late"));
        assert!(stream.collect_all().await.is_empty());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn callback_subscription_can_unsubscribe() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe_fn(move |e| sink.lock().unwrap().push(e.kind()));

        bus.publish(PipelineEvent::progress(Stage::Outliner, "one"));
        sub.unsubscribe().await.unwrap();
        bus.publish(PipelineEvent::progress(Stage::Outliner, "two"));

        assert_eq!(*seen.lock().unwrap(), vec!["progress"]);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
