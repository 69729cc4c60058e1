//! SSE framing of events written through a channel sink

use mcpstream_core::{EventFamily, SignalPayload};
use mcpstream_gateway::stream::{parse_records, ChannelSink, EventSink};
use pretty_assertions::assert_eq;
use serde_json::json;
use tests::fixtures::ContextFactory;
use tests::StreamingEvent;

#[tokio::test]
async fn test_events_survive_the_wire() {
    let factory = ContextFactory::default();
    let ctx = factory.context("wire");
    let (sink, mut rx) = ChannelSink::new(8);

    let sent = vec![
        ctx.emit_signal(SignalPayload::progress(42.5, Some("halfway".to_string())))
            .unwrap(),
        ctx.emit_signal(SignalPayload::PartialResult {
            data: json!({"rows": [1, 2, 3], "note": "line one\nline two"}),
            tool: Some("search".to_string()),
        })
        .unwrap(),
    ];

    for event in &sent {
        let payload = serde_json::to_string(event).unwrap();
        sink.write(&payload, Some(event.family().as_str())).await.unwrap();
    }
    sink.end().await;

    let mut text = String::new();
    while let Some(record) = rx.recv().await {
        text.push_str(&record);
    }

    let records = parse_records(&text);
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|r| r.event.as_deref() == Some(EventFamily::Signal.as_str())));

    let received: Vec<StreamingEvent> = records
        .iter()
        .map(|r| serde_json::from_str(&r.data).unwrap())
        .collect();
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_write_after_end_fails() {
    let (sink, _rx) = ChannelSink::new(1);
    sink.end().await;

    assert!(sink.is_closed());
    assert!(sink.write("{}", None).await.is_err());
}

#[test]
fn test_wire_shape() {
    let factory = ContextFactory::default();
    let ctx = factory.context("shape");
    let event = ctx
        .emit_signal(SignalPayload::status("started", None))
        .unwrap();

    let value = serde_json::to_value(&event).unwrap();
    assert_eq!(value["family"], "signal");
    assert_eq!(value["type"], "status");
    assert_eq!(value["status"], "started");
    assert_eq!(value["seq"], 1);
    assert!(value["timestamp"].is_string());
}
