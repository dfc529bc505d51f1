//! Replay of serialized operations into container metadata.
//!
//! Records must arrive in strictly ascending sequence order. Gaps are
//! tolerated (an operation may be abandoned after it was sequenced) but
//! counted; duplicates and regressions abort recovery.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    codec::{DecodeError, factory::OperationFactory},
    core::metadata::{ContainerMetadata, MetadataError},
    op::{Operation, OperationType},
    persist::{PersistError, SerializedRecord},
    types::SeqNo,
};

/// Fatal problem found while replaying the log.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Record could not be decoded.
    #[error("record {index}: {source}")]
    Decode {
        /// Zero-based position in the replay stream.
        index: usize,
        /// Decode failure.
        #[source]
        source: DecodeError,
    },
    /// Log stored the record under a different number than it encodes.
    #[error("record {index}: stored as sequence {stored}, decodes as {decoded}")]
    SequenceMismatch {
        /// Zero-based position in the replay stream.
        index: usize,
        /// Number the log kept alongside the bytes.
        stored: SeqNo,
        /// Number inside the bytes.
        decoded: SeqNo,
    },
    /// Duplicate or decreasing sequence number.
    #[error("sequence {found} does not follow {previous}")]
    OutOfOrder {
        /// Last replayed number.
        previous: SeqNo,
        /// Offending number.
        found: SeqNo,
    },
    /// Operation does not fit the metadata rebuilt so far.
    #[error("applying sequence {seq}: {source}")]
    Apply {
        /// Offending sequence number.
        seq: SeqNo,
        /// Metadata rejection.
        #[source]
        source: MetadataError,
    },
    /// Reading the log failed.
    #[error(transparent)]
    Persist(#[from] PersistError),
}

/// Summary of a finished replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records replayed.
    pub records: usize,
    /// Metadata checkpoints among them.
    pub checkpoints: usize,
    /// Number of places where the sequence skipped ahead.
    pub gaps: usize,
    /// First replayed sequence number.
    pub first_sequence_number: Option<SeqNo>,
    /// Last replayed sequence number.
    pub last_sequence_number: Option<SeqNo>,
}

impl RecoveryReport {
    /// Number a resumed sequencer should issue next.
    pub fn next_sequence_number(&self) -> SeqNo {
        self.last_sequence_number.map_or(0, |seq| seq.saturating_add(1))
    }
}

/// Incremental replay driver.
#[derive(Debug, Default)]
pub struct RecoveryDriver {
    factory: OperationFactory,
    metadata: ContainerMetadata,
    report: RecoveryReport,
}

impl RecoveryDriver {
    /// Driver starting from empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes and replays a record read from the log.
    pub fn apply_record(&mut self, record: &SerializedRecord) -> Result<Operation, RecoveryError> {
        let index = self.report.records;
        let operation = self.decode(&record.payload)?;
        if operation.sequence_number() != record.sequence_number {
            return Err(RecoveryError::SequenceMismatch {
                index,
                stored: record.sequence_number,
                decoded: operation.sequence_number(),
            });
        }
        self.replay(&operation)?;
        Ok(operation)
    }

    /// Decodes and replays raw record bytes.
    pub fn apply_bytes(&mut self, bytes: &[u8]) -> Result<Operation, RecoveryError> {
        let operation = self.decode(bytes)?;
        self.replay(&operation)?;
        Ok(operation)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Operation, RecoveryError> {
        self.factory
            .deserialize(bytes)
            .map_err(|source| RecoveryError::Decode {
                index: self.report.records,
                source,
            })
    }

    fn replay(&mut self, operation: &Operation) -> Result<(), RecoveryError> {
        let seq = operation.sequence_number();
        if let Some(previous) = self.report.last_sequence_number {
            if seq <= previous {
                return Err(RecoveryError::OutOfOrder {
                    previous,
                    found: seq,
                });
            }
            if seq > previous + 1 {
                warn!(previous, seq, "sequence gap during replay");
                self.report.gaps += 1;
            }
        }

        self.metadata
            .apply(operation)
            .map_err(|source| RecoveryError::Apply { seq, source })?;

        if operation.operation_type() == OperationType::MetadataCheckpoint {
            debug!(seq, "restored metadata checkpoint");
            self.report.checkpoints += 1;
        }
        self.report.first_sequence_number.get_or_insert(seq);
        self.report.last_sequence_number = Some(seq);
        self.report.records += 1;
        Ok(())
    }

    /// Metadata rebuilt so far.
    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    /// Ends the replay.
    pub fn finish(self) -> (ContainerMetadata, RecoveryReport) {
        (self.metadata, self.report)
    }
}

/// Replays `records` in order and returns the rebuilt metadata.
pub fn recover<I>(records: I) -> Result<(ContainerMetadata, RecoveryReport), RecoveryError>
where
    I: IntoIterator<Item = SerializedRecord>,
{
    let mut driver = RecoveryDriver::new();
    for record in records {
        driver.apply_record(&record)?;
    }
    let (metadata, report) = driver.finish();
    info!(
        records = report.records,
        checkpoints = report.checkpoints,
        gaps = report.gaps,
        segments = metadata.segment_count(),
        "recovery complete"
    );
    Ok((metadata, report))
}
