//! Context publishing: sequencing, validation and lifecycle

use mcpstream_core::{ContextState, PublishError};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tests::decode::seqs;
use tests::fixtures::ContextFactory;
use tests::{SignalPayload, StreamingEvent};

fn record_into(target: &Arc<Mutex<Vec<StreamingEvent>>>) -> mcpstream_core::EventListener {
    let target = target.clone();
    Arc::new(move |event: &StreamingEvent| target.lock().push(event.clone()))
}

#[test]
fn test_contexts_sequence_independently() {
    let factory = ContextFactory::default();
    let a = factory.context("a");
    let b = factory.context("b");

    let seen_a = Arc::new(Mutex::new(Vec::new()));
    let seen_b = Arc::new(Mutex::new(Vec::new()));
    let _sub_a = a.subscribe(record_into(&seen_a));
    let _sub_b = b.subscribe(record_into(&seen_b));

    for pct in [10.0, 50.0, 90.0] {
        a.emit_signal(SignalPayload::progress(pct, None)).unwrap();
        b.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }

    assert_eq!(seqs(&seen_a.lock()), vec![1, 2, 3]);
    assert_eq!(seqs(&seen_b.lock()), vec![1, 2, 3]);
    assert_eq!(factory.sequences.current("a"), 3);
    assert_eq!(factory.sequences.current("b"), 3);
}

#[test]
fn test_rejected_events_leave_no_gap() {
    let factory = ContextFactory::default();
    let ctx = factory.context("job");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = ctx.subscribe(record_into(&seen));

    ctx.emit_signal(SignalPayload::progress(10.0, None)).unwrap();
    let err = ctx
        .emit_signal(SignalPayload::progress(101.0, None))
        .unwrap_err();
    assert!(matches!(err, PublishError::Validation(ref e) if e.field == "pct"));
    ctx.emit_signal(SignalPayload::error("")).unwrap_err();
    ctx.emit_signal(SignalPayload::progress(20.0, None)).unwrap();

    assert_eq!(seqs(&seen.lock()), vec![1, 2]);
}

#[test]
fn test_concurrent_publishers_stay_gapless() {
    let factory = ContextFactory::default();
    let ctx = factory.context("busy");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _sub = ctx.subscribe(record_into(&seen));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ctx = ctx.clone();
            std::thread::spawn(move || {
                for _ in 0..50 {
                    ctx.emit_signal(SignalPayload::status("working", None)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // Listeners observe events in sequence order
    assert_eq!(seqs(&seen.lock()), (1..=200).collect::<Vec<_>>());
}

#[test]
fn test_artifact_shares_the_sequence() {
    let factory = ContextFactory::default();
    let ctx = factory.context("job");

    ctx.emit_signal(SignalPayload::status("started", None)).unwrap();
    let artifact = ctx
        .emit_artifact(tests::ArtifactFields {
            id: "art-1".to_string(),
            uri: "https://example.com/artifacts/art-1".to_string(),
            mime_type: "image/png".to_string(),
            bytes: 2048,
            ..Default::default()
        })
        .unwrap();

    assert_eq!(artifact.seq(), Some(2));
    assert_eq!(artifact.type_name(), "artifact");
}

#[test]
fn test_lifecycle_is_one_way() {
    let factory = ContextFactory::default();
    let ctx = factory.context("job");
    let states = Arc::new(Mutex::new(Vec::new()));
    let recorded = states.clone();
    let _sub = ctx.on_state_change(Arc::new(move |state: ContextState| recorded.lock().push(state)));

    assert!(ctx.cancel(Some("user aborted".to_string())));
    assert!(!ctx.complete());
    assert!(!ctx.cancel(None));

    assert_eq!(*states.lock(), vec![ContextState::Cancelled]);
    assert_eq!(ctx.cancel_reason().as_deref(), Some("user aborted"));
    assert_eq!(
        ctx.emit_signal(SignalPayload::progress(50.0, None)),
        Err(PublishError::Inactive {
            state: ContextState::Cancelled
        })
    );
}
