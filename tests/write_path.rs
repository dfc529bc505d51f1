use seglog::{
    core::{
        metadata::{ContainerMetadata, MetadataConfigurator, MetadataError},
        oplog::OperationLog,
    },
    op::{
        Operation, OperationError, OperationKind,
        config::{DeferredValue, FieldKind, PreSerializationConfigurator, configure_until_ready},
    },
    persist::{LogSink, SerializedRecord, memory::MemoryLog},
    recovery::{RecoveryDriver, RecoveryError, recover},
};

fn seeded_log() -> OperationLog {
    let mut log = OperationLog::new();
    log.create_segment("seg-a").unwrap();
    log.create_segment("seg-b").unwrap();
    log
}

#[test]
fn appends_land_at_the_segment_tail() {
    let mut log = seeded_log();
    let first = log.submit(Operation::append("seg-a", b"hello".to_vec())).unwrap();
    let second = log.submit(Operation::append("seg-a", b"world!".to_vec())).unwrap();
    assert_eq!((first.sequence_number, second.sequence_number), (2, 3));

    let ops: Vec<_> = [first, second]
        .iter()
        .map(|r| seglog::codec::factory::OperationFactory::new().deserialize(&r.payload).unwrap())
        .collect();
    let offsets: Vec<_> = ops
        .iter()
        .map(|op| match op.kind() {
            OperationKind::Append(a) => a.offset(),
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    assert_eq!(offsets, vec![Some(0), Some(5)]);
    assert_eq!(log.metadata().get("seg-a").unwrap().length, 11);
}

#[test]
fn seal_and_merge_follow_segment_state() {
    let mut log = seeded_log();
    log.submit(Operation::append("seg-a", vec![0u8; 10])).unwrap();
    log.submit(Operation::append("seg-b", vec![0u8; 4])).unwrap();

    let err = log.submit(Operation::merge("seg-a", "seg-b")).unwrap_err();
    assert!(matches!(err, MetadataError::SourceNotSealed(ref s) if s == "seg-b"));

    log.submit(Operation::seal("seg-b")).unwrap();
    log.submit(Operation::merge("seg-a", "seg-b")).unwrap();

    let a = log.metadata().get("seg-a").unwrap();
    let b = log.metadata().get("seg-b").unwrap();
    assert_eq!(a.length, 14);
    assert!(b.sealed && b.merged);

    assert!(matches!(
        log.submit(Operation::append("seg-b", vec![1])).unwrap_err(),
        MetadataError::SegmentMerged(_)
    ));
    assert!(matches!(
        log.submit(Operation::merge("seg-a", "seg-a")).unwrap_err(),
        MetadataError::SelfMerge(_)
    ));
}

#[test]
fn rejected_operation_leaves_a_gap() {
    let mut log = seeded_log();
    assert_eq!(log.next_sequence_number(), Some(2));
    let err = log.submit(Operation::append("missing", vec![1])).unwrap_err();
    assert!(matches!(err, MetadataError::SegmentNotFound(_)));
    assert_eq!(log.next_sequence_number(), Some(3));
}

#[test]
fn presequenced_operations_are_refused() {
    let mut log = seeded_log();
    let mut op = Operation::seal("seg-a");
    op.set_sequence_number(99).unwrap();
    assert!(matches!(
        log.submit(op).unwrap_err(),
        MetadataError::Operation(OperationError::AlreadySequenced { existing: 99 })
    ));
}

#[test]
fn configuration_converges_within_the_bound() {
    let log = {
        let mut log = seeded_log();
        log.submit(Operation::append("seg-b", vec![7; 3])).unwrap();
        log.submit(Operation::seal("seg-b")).unwrap();
        log
    };

    let cases = [
        (Operation::append("seg-a", vec![1]), 1),
        (Operation::seal("seg-a"), 1),
        (Operation::merge("seg-a", "seg-b"), 2),
        (Operation::map_segment(9, "seg-z", 0, false), 0),
        (Operation::metadata_checkpoint(), 1),
    ];
    for (mut op, expected) in cases {
        op.set_sequence_number(100).unwrap();
        let steps = configure_until_ready(&mut op, &mut MetadataConfigurator::new(log.metadata())).unwrap();
        assert_eq!(steps, expected, "{:?}", op.operation_type());
        assert!(op.is_ready_to_serialize());
        log.metadata().validate(&op).unwrap();
    }
}

struct WrongField;

impl PreSerializationConfigurator for WrongField {
    type Error = OperationError;

    fn supply(&mut self, _operation: &Operation, _field: FieldKind) -> Result<DeferredValue, OperationError> {
        Ok(DeferredValue::Contents(Vec::new()))
    }
}

#[test]
fn configurator_supplying_the_wrong_field_fails() {
    let mut op = Operation::seal("s");
    op.set_sequence_number(1).unwrap();
    assert_eq!(
        configure_until_ready(&mut op, &mut WrongField),
        Err(OperationError::UnexpectedField {
            supplied: FieldKind::Contents,
            pending: Some(FieldKind::Length),
        })
    );
}

#[test]
fn checkpoint_restores_metadata() {
    let mut log = seeded_log();
    log.submit(Operation::append("seg-a", vec![0; 8])).unwrap();
    log.submit(Operation::seal("seg-a")).unwrap();
    let checkpoint = log.checkpoint().unwrap();

    let mut driver = RecoveryDriver::new();
    driver.apply_record(&checkpoint).unwrap();
    let (metadata, report) = driver.finish();

    assert_eq!(metadata.snapshot(), log.metadata().snapshot());
    assert_eq!(metadata.last_sequence_number(), checkpoint.sequence_number);
    assert_eq!(report.checkpoints, 1);
}

#[test]
fn memory_log_replay_rebuilds_metadata() {
    let mut log = seeded_log();
    let mut sink = MemoryLog::new();
    let mut records = vec![];
    records.push(log.submit(Operation::append("seg-a", vec![1; 5])).unwrap());
    records.push(log.submit(Operation::append("seg-b", vec![2; 3])).unwrap());
    records.push(log.submit(Operation::seal("seg-b")).unwrap());
    records.push(log.submit(Operation::merge("seg-a", "seg-b")).unwrap());

    let mut fresh = OperationLog::new();
    let mut all = vec![
        fresh.create_segment("seg-a").unwrap(),
        fresh.create_segment("seg-b").unwrap(),
    ];
    all.extend(records);
    sink.append_records(&all).unwrap();

    let (metadata, report) = recover(sink.records()).unwrap();
    assert_eq!(metadata.snapshot(), log.metadata().snapshot());
    assert_eq!(report.records, 6);
    assert_eq!(report.gaps, 0);
    assert_eq!(report.next_sequence_number(), 6);

    let resumed = OperationLog::recovered(metadata).unwrap();
    assert_eq!(resumed.next_sequence_number(), Some(6));
}

#[test]
fn replay_counts_gaps_and_rejects_regressions() {
    let mut log = seeded_log();
    let _ = log.submit(Operation::append("missing", vec![1])).unwrap_err();
    let after_gap = log.submit(Operation::append("seg-a", vec![1])).unwrap();

    let mut fresh = OperationLog::new();
    let mut records = vec![
        fresh.create_segment("seg-a").unwrap(),
        fresh.create_segment("seg-b").unwrap(),
        after_gap.clone(),
    ];
    let (_, report) = recover(records.clone()).unwrap();
    assert_eq!(report.gaps, 1);
    assert_eq!(report.last_sequence_number, Some(3));

    records.push(after_gap);
    assert!(matches!(
        recover(records).unwrap_err(),
        RecoveryError::OutOfOrder { previous: 3, found: 3 }
    ));
}

#[test]
fn replay_rejects_mismatched_stored_sequence() {
    let mut log = OperationLog::new();
    let mut record = log.create_segment("seg-a").unwrap();
    record.sequence_number = 42;
    assert!(matches!(
        recover(vec![record]).unwrap_err(),
        RecoveryError::SequenceMismatch { index: 0, stored: 42, decoded: 0 }
    ));
}

#[test]
fn replay_surfaces_corruption_with_its_position() {
    let mut log = OperationLog::new();
    let good = log.create_segment("seg-a").unwrap();
    let mut bad = log.create_segment("seg-b").unwrap();
    bad.payload[0] = 0xee;

    let err = recover(vec![good, bad]).unwrap_err();
    match err {
        RecoveryError::Decode { index, source } => {
            assert_eq!(index, 1);
            assert!(source.is_unknown_type());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn memory_log_enforces_order_and_truncates() {
    let mut sink = MemoryLog::new();
    let mut log = seeded_log();
    let a = log.submit(Operation::append("seg-a", vec![1])).unwrap();
    let b = log.submit(Operation::append("seg-a", vec![2])).unwrap();

    sink.append_records(&[a.clone(), b.clone()]).unwrap();
    assert!(sink.append_records(&[a]).is_err());
    assert_eq!(sink.truncate_before(b.sequence_number).unwrap(), 1);
    assert_eq!(sink.records(), vec![b]);
    assert_eq!(
        SerializedRecord::from_operation(&Operation::seal("x")).unwrap_err(),
        OperationError::NotSequenced
    );
    assert!(ContainerMetadata::new().get("seg-a").is_none());
}

#[test]
fn map_rejects_an_id_already_in_use() {
    let mut log = OperationLog::new();
    log.submit(Operation::map_segment(7, "a", 0, false)).unwrap();
    assert!(matches!(
        log.submit(Operation::map_segment(7, "b", 0, false)).unwrap_err(),
        MetadataError::SegmentIdInUse(7)
    ));
    assert!(log.metadata().get("b").is_none());
    assert_eq!(log.metadata().segment_count(), 1);

    log.create_segment("b").unwrap();
    assert_eq!(log.metadata().get("b").unwrap().segment_id, 8);
}

#[test]
fn lengths_past_i64_max_are_rejected() {
    let mut log = OperationLog::new();
    log.submit(Operation::map_segment(1, "s", i64::MAX, false)).unwrap();

    assert!(matches!(
        log.submit(Operation::append("s", vec![1])).unwrap_err(),
        MetadataError::LengthOverflow(ref name) if name == "s"
    ));
    assert_eq!(log.metadata().get("s").unwrap().length, i64::MAX);
    log.submit(Operation::append("s", Vec::new())).unwrap();

    log.submit(Operation::map_segment(2, "src", 1, true)).unwrap();
    assert!(matches!(
        log.submit(Operation::merge("s", "src")).unwrap_err(),
        MetadataError::LengthOverflow(ref name) if name == "s"
    ));
    assert!(!log.metadata().get("src").unwrap().merged);
}
