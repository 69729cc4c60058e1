//! Stream connection delivery behavior

use mcpstream_gateway::stream::{
    CloseReason, ConnectionHooks, ConnectionOptions, StreamConnection, TRANSPORT_ERROR_CODE,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tests::decode::seqs;
use tests::fixtures::ContextFactory;
use tests::{RecordingSink, SignalPayload, StreamingEvent};
use tokio::time::Instant;

fn options(batch_size: usize) -> ConnectionOptions {
    ConnectionOptions {
        batch_size,
        batch_timeout: Duration::from_millis(100),
        ..Default::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_keeps_recent_and_priority_events() {
    let factory = ContextFactory::default();
    let ctx = factory.context("flood");
    let sink = RecordingSink::new();
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options(10));

    // The driver has not run yet, so all 150 events queue up
    for i in 1..=150u64 {
        if i == 5 {
            ctx.emit_signal(SignalPayload::error("upstream timeout")).unwrap();
        } else {
            ctx.emit_signal(SignalPayload::progress(50.0, None)).unwrap();
        }
    }
    assert!(conn.is_backpressure_engaged());
    // Ceiling of 100 reached at event 101: 20 recent kept, plus the error
    assert_eq!(conn.dropped_events(), 79);

    settle().await;

    let mut expected = vec![5];
    expected.extend(81..=150);
    assert_eq!(seqs(&sink.events()), expected);
    assert!(!conn.is_backpressure_engaged());
    assert!(conn.is_active());
}

/// Options with no recovery credit, so failures accumulate across reports
fn without_credit(batch_size: usize) -> ConnectionOptions {
    let mut options = options(batch_size);
    options.tuning.recovery_credit = 0;
    options
}

fn report_counts(events: &[StreamingEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match &e.as_signal()?.payload {
            SignalPayload::Error {
                code,
                failure_count,
                recoverable,
                ..
            } => {
                assert_eq!(code.as_deref(), Some(TRANSPORT_ERROR_CODE));
                assert!(*recoverable);
                *failure_count
            }
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_breaker_trips_at_five_consecutive_failures() {
    let factory = ContextFactory::default();
    let ctx = factory.context("broken");
    let sink = RecordingSink::failing_except_reports();
    let errors = Arc::new(AtomicU32::new(0));
    let counter = errors.clone();

    let conn = StreamConnection::open_with_hooks(
        ctx.clone(),
        sink.clone(),
        without_credit(5),
        ConnectionHooks {
            on_close: None,
            on_error: Some(Arc::new(move |_, failures| {
                counter.store(failures, Ordering::SeqCst);
            })),
        },
    );

    for pct in [10.0, 20.0, 30.0, 40.0, 50.0] {
        ctx.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }
    conn.wait_closed().await;

    assert_eq!(conn.close_reason(), Some(CloseReason::CircuitOpen));
    assert_eq!(errors.load(Ordering::SeqCst), 5);
    // The fifth failure closes instead of reporting
    assert_eq!(report_counts(&sink.events()), vec![1, 2, 3, 4]);
    assert_eq!(conn.sent_events(), 4);
    assert!(sink.is_ended());
    assert_eq!(ctx.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_do_not_trip_the_breaker() {
    let factory = ContextFactory::default();
    let ctx = factory.context("flaky");
    let sink = RecordingSink::failing_except_reports();
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), without_credit(4));

    for pct in [10.0, 20.0, 30.0, 40.0] {
        ctx.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }
    settle().await;

    assert!(conn.is_active());
    assert_eq!(conn.consecutive_failures(), 4);
    assert_eq!(report_counts(&sink.events()), vec![1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_each_delivered_report_earns_back_a_failure() {
    let factory = ContextFactory::default();
    let ctx = factory.context("flaky");
    let sink = RecordingSink::failing_except_reports();
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options(10));

    for pct in [10.0, 20.0, 30.0, 40.0, 50.0, 60.0] {
        ctx.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Every report follows its failure directly, so the count never builds up
    assert!(conn.is_active());
    assert_eq!(conn.consecutive_failures(), 0);
    let reports = sink.events();
    assert_eq!(report_counts(&reports), vec![1; 6]);
    assert!(reports.iter().all(|e| e.seq().is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_successful_write_resets_failures() {
    let factory = ContextFactory::default();
    let ctx = factory.context("recovering");
    let writes = Arc::new(AtomicUsize::new(0));
    let seen = writes.clone();
    // Fail the first three progress writes, deliver everything after
    let sink = RecordingSink::failing(move |payload| {
        payload.contains(r#""type":"progress""#) && seen.fetch_add(1, Ordering::SeqCst) < 3
    });
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), without_credit(10));

    for pct in [10.0, 20.0, 30.0, 40.0] {
        ctx.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(conn.is_active());
    assert_eq!(conn.consecutive_failures(), 0);
    assert_eq!(writes.load(Ordering::SeqCst), 4);
    let events = sink.events();
    assert_eq!(report_counts(&events), vec![1, 2, 3]);
    assert_eq!(seqs(&events), vec![4]);
}

#[tokio::test(start_paused = true)]
async fn test_report_write_failure_closes_connection() {
    let factory = ContextFactory::default();
    let ctx = factory.context("dead");
    let sink = RecordingSink::failing(|_| true);
    let errors = Arc::new(AtomicU32::new(0));
    let counter = errors.clone();
    let conn = StreamConnection::open_with_hooks(
        ctx.clone(),
        sink.clone(),
        options(10),
        ConnectionHooks {
            on_close: None,
            on_error: Some(Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        },
    );

    for pct in [10.0, 20.0, 30.0, 40.0] {
        ctx.emit_signal(SignalPayload::progress(pct, None)).unwrap();
    }
    conn.wait_closed().await;

    assert_eq!(conn.close_reason(), Some(CloseReason::CircuitOpen));
    // First event write, then its report; nothing after
    assert_eq!(sink.attempts(), 2);
    assert_eq!(errors.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_adaptive_batching_shortens_the_timer() {
    let factory = ContextFactory::default();
    let ctx = factory.context("batched");
    let sink = RecordingSink::new();
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options(10));

    ctx.emit_signal(SignalPayload::progress(1.0, None)).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(conn.queue_len(), 1);

    // Whole batch: flushed without waiting for the timer
    for _ in 0..9 {
        ctx.emit_signal(SignalPayload::progress(2.0, None)).unwrap();
    }
    settle().await;
    assert_eq!(conn.sent_events(), 10);
    assert_eq!(conn.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_deep_queue_halves_the_timer_during_a_slow_flush() {
    let factory = ContextFactory::default();
    let ctx = factory.context("slow");
    let sink = RecordingSink::slow(Duration::from_millis(2));
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options(10));
    let start = Instant::now();

    // Three chunks of ten, each write 2ms: the flush runs until 60ms
    for _ in 0..30 {
        ctx.emit_signal(SignalPayload::progress(1.0, None)).unwrap();
    }

    // Mid-flush the last chunk is still queued, so this event makes the
    // depth 11 and its timer 50ms instead of 100ms
    tokio::time::sleep_until(start + Duration::from_millis(25)).await;
    ctx.emit_signal(SignalPayload::progress(2.0, None)).unwrap();

    tokio::time::sleep_until(start + Duration::from_millis(70)).await;
    assert_eq!(sink.len(), 30);
    assert_eq!(conn.queue_len(), 1);

    tokio::time::sleep_until(start + Duration::from_millis(80)).await;
    assert_eq!(sink.len(), 31);
    assert_eq!(conn.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_emergency_depth_flushes_without_a_timer() {
    let factory = ContextFactory::default();
    let ctx = factory.context("burst");
    let sink = RecordingSink::slow(Duration::from_millis(2));
    let options = ConnectionOptions {
        batch_size: 10,
        batch_timeout: Duration::from_secs(10),
        ..Default::default()
    };
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options);
    let start = Instant::now();

    for _ in 0..10 {
        ctx.emit_signal(SignalPayload::progress(1.0, None)).unwrap();
    }

    // Five batches arrive while the first one is still being written
    tokio::time::sleep_until(start + Duration::from_millis(5)).await;
    for _ in 0..50 {
        ctx.emit_signal(SignalPayload::progress(2.0, None)).unwrap();
    }
    assert_eq!(conn.queue_len(), 50);

    // 60 writes at 2ms each, far inside the 10s batch timeout
    tokio::time::sleep_until(start + Duration::from_millis(125)).await;
    assert_eq!(sink.len(), 60);
    assert_eq!(seqs(&sink.events()), (1..=60).collect::<Vec<u64>>());
    assert_eq!(conn.dropped_events(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_delivers_queued_events_first() {
    let factory = ContextFactory::default();
    let ctx = factory.context("cancelled");
    let sink = RecordingSink::new();
    let conn = StreamConnection::open(ctx.clone(), sink.clone(), options(10));

    ctx.emit_signal(SignalPayload::progress(10.0, None)).unwrap();
    ctx.emit_signal(SignalPayload::progress(20.0, None)).unwrap();
    ctx.cancel(Some("timeout".to_string()));
    conn.wait_closed().await;

    let events = sink.events();
    assert_eq!(seqs(&events), vec![1, 2]);
    assert_eq!(events.last().map(|e| e.type_name()), Some("cancel"));
    assert_eq!(conn.close_reason(), Some(CloseReason::Cancelled));
}
