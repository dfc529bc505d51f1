use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::sync::broadcast;

use seglog::{
    core::{metadata::MetadataError, oplog::OperationLog},
    op::{Operation, OperationType},
    persist::{LogSink, PersistError, PersistResult, SerializedRecord, memory::MemoryLog},
    recovery::recover,
    runtime::{
        events::LogEvent,
        handle::{RuntimeConfig, RuntimeError, spawn_operation_log},
    },
    types::SeqNo,
};

struct SlowSink {
    seen: Arc<Mutex<Vec<SeqNo>>>,
    delay: Duration,
}

impl LogSink for SlowSink {
    fn append_records(&mut self, records: &[SerializedRecord]) -> PersistResult<SeqNo> {
        std::thread::sleep(self.delay);
        let mut seen = self.seen.lock().expect("lock");
        for record in records {
            seen.push(record.sequence_number);
        }
        Ok(records.last().map_or(-1, |r| r.sequence_number))
    }
}

/// Fails appends while `failures_left > 0` or `broken` is set, storing
/// nothing from a failed batch.
struct FlakySink {
    inner: MemoryLog,
    failures_left: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl LogSink for FlakySink {
    fn append_records(&mut self, records: &[SerializedRecord]) -> PersistResult<SeqNo> {
        let counted = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if counted || self.broken.load(Ordering::SeqCst) {
            return Err(PersistError::Message("disk unavailable".to_string()));
        }
        self.inner.append_records(records)
    }
}

fn flaky(failures: usize, broken: bool) -> (FlakySink, MemoryLog, Arc<AtomicBool>) {
    let inner = MemoryLog::new();
    let broken = Arc::new(AtomicBool::new(broken));
    let sink = FlakySink {
        inner: inner.clone(),
        failures_left: Arc::new(AtomicUsize::new(failures)),
        broken: Arc::clone(&broken),
    };
    (sink, inner, broken)
}

fn quiet_config() -> RuntimeConfig {
    RuntimeConfig {
        checkpoint_every_ops: 0,
        ..RuntimeConfig::default()
    }
}

async fn next_non_durable(sub: &mut broadcast::Receiver<LogEvent>) -> LogEvent {
    loop {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if !matches!(evt, LogEvent::DurableUpTo { .. }) {
            return evt;
        }
    }
}

#[tokio::test]
async fn runtime_submit_query_and_events_ordered() {
    let handle = spawn_operation_log(OperationLog::new(), None, quiet_config());
    let mut sub = handle.subscribe();

    assert_eq!(handle.create_segment("orders").await.expect("map"), 0);
    let seq = handle
        .submit(Operation::append("orders", b"abc".to_vec()))
        .await
        .expect("append");
    assert_eq!(seq, 1);

    let segment = handle.segment("orders").await.expect("query").expect("segment");
    assert_eq!(segment.length, 3);
    assert!(handle.segment("missing").await.expect("query").is_none());

    assert_eq!(
        next_non_durable(&mut sub).await,
        LogEvent::Committed {
            seq: 0,
            op_type: OperationType::MapSegment
        }
    );
    assert_eq!(
        next_non_durable(&mut sub).await,
        LogEvent::Committed {
            seq: 1,
            op_type: OperationType::Append
        }
    );

    let err = handle
        .submit(Operation::seal("missing"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Metadata(MetadataError::SegmentNotFound(ref name)) if name == "missing"
    ));

    assert_eq!(handle.flush().await.expect("flush"), 1);
    handle.shutdown().await.expect("shutdown");
    assert!(matches!(
        handle.create_segment("late").await,
        Err(RuntimeError::ChannelClosed)
    ));
}

#[tokio::test]
async fn memory_sink_receives_every_committed_record() {
    let sink = MemoryLog::new();
    let handle = spawn_operation_log(OperationLog::new(), Some(Box::new(sink.clone())), quiet_config());
    let mut sub = handle.subscribe();

    handle.create_segment("a").await.expect("map a");
    handle.create_segment("b").await.expect("map b");
    for i in 0..10u8 {
        handle
            .submit(Operation::append("b", vec![i; 4]))
            .await
            .expect("append");
    }
    handle.submit(Operation::seal("b")).await.expect("seal");
    let last = handle.submit(Operation::merge("a", "b")).await.expect("merge");

    assert_eq!(handle.flush().await.expect("flush"), last);

    let mut durable = -1;
    while durable < last {
        let evt = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("event")
            .expect("recv");
        if let LogEvent::DurableUpTo { seq } = evt {
            assert!(seq >= durable);
            durable = seq;
        }
    }

    handle.shutdown().await.expect("shutdown");

    let (metadata, report) = recover(sink.records()).expect("replay");
    assert_eq!(report.records, 14);
    assert_eq!(metadata.get("a").expect("a").length, 40);
    assert!(metadata.get("b").expect("b").merged);
}

#[tokio::test]
async fn checkpoint_truncates_older_records() {
    let sink = MemoryLog::new();
    let cfg = RuntimeConfig {
        truncate_after_checkpoint: true,
        ..quiet_config()
    };
    let handle = spawn_operation_log(OperationLog::new(), Some(Box::new(sink.clone())), cfg);
    let mut sub = handle.subscribe();

    handle.create_segment("s").await.expect("map");
    handle.submit(Operation::append("s", vec![1; 8])).await.expect("append");
    let checkpoint = handle.checkpoint().await.expect("checkpoint");
    assert_eq!(checkpoint, 2);
    handle.submit(Operation::append("s", vec![2; 2])).await.expect("append after");

    let mut checkpointed = false;
    for _ in 0..8 {
        if next_non_durable(&mut sub).await == (LogEvent::Checkpointed { seq: checkpoint }) {
            checkpointed = true;
            break;
        }
    }
    assert!(checkpointed, "expected Checkpointed event");

    handle.shutdown().await.expect("shutdown");

    let records = sink.records();
    assert_eq!(records.first().map(|r| r.sequence_number), Some(checkpoint));
    assert_eq!(records.len(), 2);

    let (metadata, report) = recover(records).expect("replay");
    assert_eq!(metadata.get("s").expect("s").length, 10);
    assert_eq!(report.checkpoints, 1);
}

#[tokio::test]
async fn automatic_checkpoint_follows_operation_count() {
    let cfg = RuntimeConfig {
        checkpoint_every_ops: 3,
        ..RuntimeConfig::default()
    };
    let handle = spawn_operation_log(OperationLog::new(), None, cfg);
    let mut sub = handle.subscribe();

    handle.create_segment("s").await.expect("map");
    handle.submit(Operation::append("s", vec![0])).await.expect("append");
    handle.submit(Operation::append("s", vec![0])).await.expect("append");

    let mut events = Vec::new();
    for _ in 0..5 {
        events.push(next_non_durable(&mut sub).await);
    }
    assert_eq!(
        events[3],
        LogEvent::Committed {
            seq: 3,
            op_type: OperationType::MetadataCheckpoint
        }
    );
    assert_eq!(events[4], LogEvent::Checkpointed { seq: 3 });

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn slow_sink_applies_backpressure_without_losing_records() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = SlowSink {
        seen: Arc::clone(&seen),
        delay: Duration::from_millis(50),
    };

    let cfg = RuntimeConfig {
        flush_on_seal: true,
        batch_max_ops: 4,
        batch_max_latency_ms: 500,
        persist_queue_bound: 1,
        checkpoint_every_ops: 0,
        truncate_after_checkpoint: false,
    };

    let handle = spawn_operation_log(OperationLog::new(), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();

    handle.create_segment("s").await.expect("map");
    for i in 0..12u8 {
        handle.submit(Operation::append("s", vec![i])).await.expect("append under pressure");
    }

    let mut durable_seen = false;
    for _ in 0..32 {
        let evt = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv timeout")
            .expect("recv");
        if matches!(evt, LogEvent::DurableUpTo { .. }) {
            durable_seen = true;
            break;
        }
    }
    assert!(durable_seen, "expected DurableUpTo event");

    assert_eq!(handle.flush().await.expect("flush"), 12);
    handle.shutdown().await.expect("shutdown");

    let seen = seen.lock().expect("lock").clone();
    assert_eq!(seen, (0..=12).collect::<Vec<SeqNo>>());
}

#[tokio::test]
async fn failed_batch_is_retried_before_newer_records() {
    let (sink, stored, _) = flaky(1, false);
    let cfg = RuntimeConfig {
        batch_max_ops: 1,
        batch_max_latency_ms: 60_000,
        ..quiet_config()
    };
    let handle = spawn_operation_log(OperationLog::new(), Some(Box::new(sink)), cfg);

    assert_eq!(handle.create_segment("a").await.expect("map"), 0);
    assert_eq!(
        handle
            .submit(Operation::append("a", b"xyz".to_vec()))
            .await
            .expect("append"),
        1
    );
    assert_eq!(handle.flush().await.expect("flush"), 1);
    handle.shutdown().await.expect("shutdown");

    let records = stored.records();
    assert_eq!(
        records.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
        vec![0, 1]
    );
    let (metadata, _) = recover(records).expect("replay");
    assert_eq!(metadata.get("a").expect("a").length, 3);
}

#[tokio::test]
async fn flush_and_shutdown_report_held_back_records() {
    let (sink, stored, broken) = flaky(0, true);
    let cfg = RuntimeConfig {
        batch_max_ops: 1,
        batch_max_latency_ms: 60_000,
        ..quiet_config()
    };
    let handle = spawn_operation_log(OperationLog::new(), Some(Box::new(sink)), cfg);
    let mut sub = handle.subscribe();

    handle.create_segment("a").await.expect("map");
    handle.submit(Operation::append("a", vec![1])).await.expect("append");

    let err = handle.flush().await.unwrap_err();
    assert!(matches!(
        err,
        RuntimeError::Persist(PersistError::Stalled {
            pending: 2,
            last_durable: -1,
            ..
        })
    ));
    assert!(matches!(
        handle.shutdown().await,
        Err(RuntimeError::Persist(PersistError::Stalled { .. }))
    ));
    assert!(stored.is_empty());
    assert!(matches!(
        next_non_durable(&mut sub).await,
        LogEvent::Committed { seq: 0, .. }
    ));

    let mut failure_seen = false;
    for _ in 0..8 {
        if matches!(next_non_durable(&mut sub).await, LogEvent::PersistFailed { .. }) {
            failure_seen = true;
            break;
        }
    }
    assert!(failure_seen, "expected PersistFailed event");

    broken.store(false, Ordering::SeqCst);
    assert_eq!(handle.flush().await.expect("flush after repair"), 1);
    handle.shutdown().await.expect("shutdown");

    let (metadata, report) = recover(stored.records()).expect("replay");
    assert_eq!(report.records, 2);
    assert_eq!(metadata.get("a").expect("a").length, 1);
}

#[test]
fn runtime_config_accepts_partial_json() {
    let cfg = RuntimeConfig::from_json(r#"{"batch_max_ops": 8, "truncate_after_checkpoint": true}"#)
        .expect("parse");
    assert_eq!(cfg.batch_max_ops, 8);
    assert!(cfg.truncate_after_checkpoint);
    assert_eq!(cfg.batch_max_latency_ms, RuntimeConfig::default().batch_max_latency_ms);
    assert!(cfg.flush_on_seal);

    assert!(RuntimeConfig::from_json(r#"{"batch_max_ops": "many"}"#).is_err());
}
