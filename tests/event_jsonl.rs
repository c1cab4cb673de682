use quill_harness::events::{EventBus, JsonlEventSink, PipelineEvent};
use quill_harness::pipeline::{AgentProgress, Metrics, Stage, StageStatus};
use tempfile::tempdir;

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRow {
    #[serde(rename = "type")]
    kind: String,
    stage: Option<String>,
    status: Option<String>,
    backoff_delay: Option<f64>,
}

fn retrying(stage: Stage, attempt: u32, delay: f64) -> PipelineEvent {
    let mut p = AgentProgress::waiting(stage, 3);
    p.status = StageStatus::Retrying;
    p.attempt = attempt;
    p.backoff_delay = Some(delay);
    PipelineEvent::stage_update(&p)
}

fn read_rows(path: &std::path::Path) -> Vec<EventRow> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn jsonl_event_sink_writes_lines_and_flushes_on_join() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");

    let (sink, writer) = JsonlEventSink::new(&path).unwrap();
    sink.record(PipelineEvent::progress(Stage::Outliner, "Creating story outline..."))
        .unwrap();
    sink.record(retrying(Stage::Outliner, 1, 1.0)).unwrap();
    drop(sink);
    assert_eq!(writer.join().unwrap(), 2);

    let rows = read_rows(&path);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].kind, "progress");
    assert_eq!(rows[0].stage.as_deref(), Some("outliner"));
    assert_eq!(rows[1].kind, "stageUpdate");
    assert_eq!(rows[1].status.as_deref(), Some("retrying"));
    assert_eq!(rows[1].backoff_delay, Some(1.0));
}

#[tokio::test]
async fn attached_sink_records_the_whole_bus_until_close() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("events.jsonl");
    let bus = EventBus::new();

    let (sink, writer) = JsonlEventSink::new(&path).unwrap();
    let subscription = sink.attach(&bus);

    bus.publish(PipelineEvent::progress(Stage::Writer, "Generating initial draft..."));
    bus.publish(retrying(Stage::Writer, 1, 1.0));
    bus.publish(retrying(Stage::Writer, 2, 2.0));
    bus.publish(PipelineEvent::MetricsUpdate(Metrics::default()));
    bus.publish(PipelineEvent::Complete {
        output: "fin".into(),
        metrics: Metrics::default(),
    });
    bus.close();
    bus.publish(PipelineEvent::warning(None, "after close"));

    subscription.finished().await;
    assert_eq!(writer.join().unwrap(), 5);

    let rows = read_rows(&path);
    let kinds: Vec<&str> = rows.iter().map(|r| r.kind.as_str()).collect();
    assert_eq!(
        kinds,
        vec!["progress", "stageUpdate", "stageUpdate", "metricsUpdate", "complete"]
    );
    let delays: Vec<f64> = rows.iter().filter_map(|r| r.backoff_delay).collect();
    assert_eq!(delays, vec![1.0, 2.0]);
}
