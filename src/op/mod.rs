//! Operation model: one sequenced, typed record per segment mutation.
//!
//! An [`Operation`] moves through three states:
//! [`OperationState::Unsequenced`] until the [`crate::core::sequencer::Sequencer`]
//! assigns it a number, [`OperationState::AwaitingConfiguration`] while
//! deferred fields are outstanding, and [`OperationState::Ready`] once it
//! may be serialized. Every transition is checked.

/// Deferred fields and the configuration loop.
pub mod config;
/// Per-variant payloads and their codecs.
pub mod variants;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    codec::RecordWriter,
    types::{NO_SEQUENCE_NUMBER, SegmentId, SeqNo},
};

use config::{DeferredValue, FieldKind};
use variants::{
    AppendOperation, MapSegmentOperation, MergeOperation, MetadataCheckpointOperation,
    OperationPayload, SealOperation,
};

/// Invalid use of an operation on the write path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// A sequence number was already assigned.
    #[error("operation already has sequence number {existing}")]
    AlreadySequenced {
        /// Number assigned earlier.
        existing: SeqNo,
    },
    /// Sequence numbers must be non-negative.
    #[error("invalid sequence number {0}")]
    InvalidSequenceNumber(SeqNo),
    /// The sequencer has issued `i64::MAX`.
    #[error("sequence numbers exhausted")]
    SequenceExhausted,
    /// Operation has not been sequenced.
    #[error("operation has no sequence number")]
    NotSequenced,
    /// A deferred field is still missing.
    #[error("operation is missing deferred field `{missing}`")]
    NotConfigured {
        /// Next field the operation needs.
        missing: FieldKind,
    },
    /// Supplied value does not match the pending field.
    #[error("cannot configure `{supplied}`, pending field is {pending:?}")]
    UnexpectedField {
        /// Field the caller supplied.
        supplied: FieldKind,
        /// Field the operation actually needs, if any.
        pending: Option<FieldKind>,
    },
    /// Offsets and lengths must be non-negative.
    #[error("`{field}` must be non-negative, got {value}")]
    NegativeValue {
        /// Offending field.
        field: FieldKind,
        /// Supplied value.
        value: i64,
    },
    /// Configuration loop did not converge.
    #[error("pre-serialization configuration did not finish within {0} steps")]
    ConfigurationLimitExceeded(usize),
    /// Field cannot be represented by its length prefix.
    #[error("`{field}` is {len} bytes, limit is {max}")]
    FieldTooLong {
        /// Offending field.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Encodable maximum.
        max: usize,
    },
}

impl OperationError {
    /// True for errors caused by calling a step out of order; the caller
    /// can complete the missing step and retry.
    pub fn is_invalid_state(&self) -> bool {
        matches!(
            self,
            Self::AlreadySequenced { .. }
                | Self::NotSequenced
                | Self::NotConfigured { .. }
                | Self::UnexpectedField { .. }
        )
    }
}

/// Wire tag for each operation variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperationType {
    /// Data appended to a segment.
    Append = 1,
    /// Segment sealed against further appends.
    Seal = 2,
    /// Sealed source segment concatenated onto a target.
    Merge = 3,
    /// Segment name bound to an id in container metadata.
    MapSegment = 4,
    /// Snapshot of container metadata.
    MetadataCheckpoint = 5,
}

impl OperationType {
    /// Every known type, in tag order.
    pub const ALL: [Self; 5] = [
        Self::Append,
        Self::Seal,
        Self::Merge,
        Self::MapSegment,
        Self::MetadataCheckpoint,
    ];

    /// Byte written at the front of the record.
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Resolves a wire tag; `None` for anything unknown.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|ty| ty.tag() == tag)
    }
}

/// Position of an operation in its write-path lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    /// No sequence number yet.
    Unsequenced,
    /// Sequenced, waiting for the named deferred field.
    AwaitingConfiguration(FieldKind),
    /// May be serialized.
    Ready,
}

/// Variant payload of an [`Operation`].
#[derive(Debug, Clone)]
pub enum OperationKind {
    /// See [`AppendOperation`].
    Append(AppendOperation),
    /// See [`SealOperation`].
    Seal(SealOperation),
    /// See [`MergeOperation`].
    Merge(MergeOperation),
    /// See [`MapSegmentOperation`].
    MapSegment(MapSegmentOperation),
    /// See [`MetadataCheckpointOperation`].
    MetadataCheckpoint(MetadataCheckpointOperation),
}

impl OperationKind {
    /// Wire tag of this variant.
    pub fn operation_type(&self) -> OperationType {
        match self {
            Self::Append(_) => AppendOperation::TYPE,
            Self::Seal(_) => SealOperation::TYPE,
            Self::Merge(_) => MergeOperation::TYPE,
            Self::MapSegment(_) => MapSegmentOperation::TYPE,
            Self::MetadataCheckpoint(_) => MetadataCheckpointOperation::TYPE,
        }
    }

    fn pending_field(&self) -> Option<FieldKind> {
        match self {
            Self::Append(p) => p.pending_field(),
            Self::Seal(p) => p.pending_field(),
            Self::Merge(p) => p.pending_field(),
            Self::MapSegment(p) => p.pending_field(),
            Self::MetadataCheckpoint(p) => p.pending_field(),
        }
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        match self {
            Self::Append(p) => p.configure(value),
            Self::Seal(p) => p.configure(value),
            Self::Merge(p) => p.configure(value),
            Self::MapSegment(p) => p.configure(value),
            Self::MetadataCheckpoint(p) => p.configure(value),
        }
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        match self {
            Self::Append(p) => p.encode(w),
            Self::Seal(p) => p.encode(w),
            Self::Merge(p) => p.encode(w),
            Self::MapSegment(p) => p.encode(w),
            Self::MetadataCheckpoint(p) => p.encode(w),
        }
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        match (self, other) {
            (Self::Append(a), Self::Append(b)) => a.mismatch(b),
            (Self::Seal(a), Self::Seal(b)) => a.mismatch(b),
            (Self::Merge(a), Self::Merge(b)) => a.mismatch(b),
            (Self::MapSegment(a), Self::MapSegment(b)) => a.mismatch(b),
            (Self::MetadataCheckpoint(a), Self::MetadataCheckpoint(b)) => a.mismatch(b),
            _ => Some("operation_type"),
        }
    }
}

/// One log record describing a single segment mutation.
#[derive(Debug, Clone)]
pub struct Operation {
    sequence_number: SeqNo,
    kind: OperationKind,
}

impl Operation {
    /// Wraps `kind` in an unsequenced operation.
    pub fn new(kind: OperationKind) -> Self {
        Self {
            sequence_number: NO_SEQUENCE_NUMBER,
            kind,
        }
    }

    /// Append of `data` to `segment_name`; the offset is configured later.
    pub fn append(segment_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::new(OperationKind::Append(AppendOperation::new(segment_name, data)))
    }

    /// Seal of `segment_name`; the sealed length is configured later.
    pub fn seal(segment_name: impl Into<String>) -> Self {
        Self::new(OperationKind::Seal(SealOperation::new(segment_name)))
    }

    /// Merge of sealed `source_segment` into `target_segment`.
    pub fn merge(target_segment: impl Into<String>, source_segment: impl Into<String>) -> Self {
        Self::new(OperationKind::Merge(MergeOperation::new(target_segment, source_segment)))
    }

    /// Binding of `segment_name` to `segment_id` with its current state.
    pub fn map_segment(
        segment_id: SegmentId,
        segment_name: impl Into<String>,
        length: i64,
        sealed: bool,
    ) -> Self {
        Self::new(OperationKind::MapSegment(MapSegmentOperation::new(
            segment_id,
            segment_name,
            length,
            sealed,
        )))
    }

    /// Metadata checkpoint; the contents are configured later.
    pub fn metadata_checkpoint() -> Self {
        Self::new(OperationKind::MetadataCheckpoint(MetadataCheckpointOperation::new()))
    }

    pub(crate) fn from_parts(sequence_number: SeqNo, kind: OperationKind) -> Self {
        Self {
            sequence_number,
            kind,
        }
    }

    /// Assigned sequence number, or [`NO_SEQUENCE_NUMBER`].
    pub fn sequence_number(&self) -> SeqNo {
        self.sequence_number
    }

    /// True once a sequence number has been assigned.
    pub fn is_sequenced(&self) -> bool {
        self.sequence_number >= 0
    }

    /// Assigns the sequence number. Allowed exactly once.
    pub fn set_sequence_number(&mut self, sequence_number: SeqNo) -> Result<(), OperationError> {
        if self.is_sequenced() {
            return Err(OperationError::AlreadySequenced {
                existing: self.sequence_number,
            });
        }
        if sequence_number < 0 {
            return Err(OperationError::InvalidSequenceNumber(sequence_number));
        }
        self.sequence_number = sequence_number;
        Ok(())
    }

    /// Wire tag of this operation.
    pub fn operation_type(&self) -> OperationType {
        self.kind.operation_type()
    }

    /// Variant payload.
    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    /// Next deferred field this operation needs, if any.
    pub fn pending_field(&self) -> Option<FieldKind> {
        self.kind.pending_field()
    }

    /// True when no deferred field is outstanding.
    pub fn is_configured(&self) -> bool {
        self.pending_field().is_none()
    }

    /// True when the operation is sequenced and fully configured.
    pub fn is_ready_to_serialize(&self) -> bool {
        self.state() == OperationState::Ready
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        if !self.is_sequenced() {
            return OperationState::Unsequenced;
        }
        match self.pending_field() {
            Some(field) => OperationState::AwaitingConfiguration(field),
            None => OperationState::Ready,
        }
    }

    /// Supplies the pending deferred field. The operation must already be
    /// sequenced and `value` must match [`Self::pending_field`].
    pub fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        if !self.is_sequenced() {
            return Err(OperationError::NotSequenced);
        }
        value.validate()?;
        self.kind.configure(value)
    }

    fn ensure_ready(&self) -> Result<(), OperationError> {
        match self.state() {
            OperationState::Unsequenced => Err(OperationError::NotSequenced),
            OperationState::AwaitingConfiguration(missing) => {
                Err(OperationError::NotConfigured { missing })
            }
            OperationState::Ready => Ok(()),
        }
    }

    /// Encodes the operation into a new buffer.
    pub fn serialize(&self) -> Result<Vec<u8>, OperationError> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded operation to `buf`. On error `buf` is left as
    /// it was.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) -> Result<(), OperationError> {
        self.ensure_ready()?;
        let start = buf.len();
        let mut w = RecordWriter::new(buf);
        w.put_u8(self.operation_type().tag());
        w.put_i64(self.sequence_number);
        let res = self.kind.encode(&mut w);
        if res.is_err() {
            buf.truncate(start);
        }
        res
    }

    /// Name of the first wire field that differs from `other`, comparing
    /// sequence number, type and payload only.
    pub fn first_mismatch(&self, other: &Operation) -> Option<&'static str> {
        if self.sequence_number != other.sequence_number {
            return Some("sequence_number");
        }
        self.kind.mismatch(&other.kind)
    }

    /// True when [`Self::first_mismatch`] finds no difference.
    pub fn matches(&self, other: &Operation) -> bool {
        self.first_mismatch(other).is_none()
    }
}
