use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    op::{
        Operation, OperationError, OperationKind, OperationState, OperationType,
        config::{DeferredValue, FieldKind, PreSerializationConfigurator},
    },
    types::{NO_SEQUENCE_NUMBER, SegmentId, SeqNo},
};

/// Operation rejected by, or unusable against, container metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Operation is not in a state that can be applied.
    #[error(transparent)]
    Operation(#[from] OperationError),
    /// Named segment is not mapped.
    #[error("segment `{0}` is not mapped")]
    SegmentNotFound(String),
    /// Map operation for a name already in use.
    #[error("segment `{0}` is already mapped")]
    AlreadyMapped(String),
    /// Write to a sealed segment.
    #[error("segment `{0}` is sealed")]
    SegmentSealed(String),
    /// Write to, or second merge of, a merged segment.
    #[error("segment `{0}` has been merged")]
    SegmentMerged(String),
    /// Merge of a source that was never sealed.
    #[error("merge source `{0}` is not sealed")]
    SourceNotSealed(String),
    /// Map operation reusing the id of a mapped segment.
    #[error("segment id {0} is already in use")]
    SegmentIdInUse(SegmentId),
    /// Segment length would exceed `i64::MAX`.
    #[error("segment `{0}` length would overflow")]
    LengthOverflow(String),
    /// Merge whose source and target coincide.
    #[error("segment `{0}` cannot be merged into itself")]
    SelfMerge(String),
    /// Operation offset does not match the segment tail.
    #[error("segment `{segment}`: expected offset {expected}, operation has {actual}")]
    OffsetMismatch {
        /// Segment name.
        segment: String,
        /// Current segment length.
        expected: i64,
        /// Offset carried by the operation.
        actual: i64,
    },
    /// Operation length does not match the segment length.
    #[error("segment `{segment}`: expected length {expected}, operation has {actual}")]
    LengthMismatch {
        /// Segment name.
        segment: String,
        /// Current segment length.
        expected: i64,
        /// Length carried by the operation.
        actual: i64,
    },
    /// Configurator has no source for this field of this operation type.
    #[error("cannot supply `{field}` for {op_type:?}")]
    UnsupportedField {
        /// Operation type asked about.
        op_type: OperationType,
        /// Field requested.
        field: FieldKind,
    },
    /// Checkpoint contents could not be encoded or decoded.
    #[error("checkpoint contents: {0}")]
    Checkpoint(#[from] serde_json::Error),
}

/// State of one mapped segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// Segment id.
    pub segment_id: SegmentId,
    /// Segment name.
    pub name: String,
    /// Bytes written so far, including merged-in data.
    pub length: i64,
    /// No further appends accepted.
    pub sealed: bool,
    /// Data moved into another segment.
    pub merged: bool,
}

/// Serializable image of [`ContainerMetadata`], ordered by segment id.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MetadataSnapshot {
    /// Next id to hand out.
    pub next_segment_id: SegmentId,
    /// Mapped segments.
    pub segments: Vec<SegmentMetadata>,
}

/// Segment state mutated by operations, both live and during replay.
#[derive(Debug)]
pub struct ContainerMetadata {
    segments: HashMap<String, SegmentMetadata>,
    next_segment_id: SegmentId,
    last_sequence_number: SeqNo,
}

impl Default for ContainerMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerMetadata {
    /// Empty metadata; segment ids start at 1.
    pub fn new() -> Self {
        Self {
            segments: HashMap::new(),
            next_segment_id: 1,
            last_sequence_number: NO_SEQUENCE_NUMBER,
        }
    }

    /// Metadata restored from `snapshot`.
    pub fn from_snapshot(snapshot: MetadataSnapshot) -> Self {
        let mut metadata = Self::new();
        metadata.restore(snapshot);
        metadata
    }

    /// Segment by name.
    pub fn get(&self, name: &str) -> Option<&SegmentMetadata> {
        self.segments.get(name)
    }

    /// Number of mapped segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Id the next new segment receives.
    pub fn next_segment_id(&self) -> SegmentId {
        self.next_segment_id
    }

    /// Highest sequence number applied so far.
    pub fn last_sequence_number(&self) -> SeqNo {
        self.last_sequence_number
    }

    /// Current state as a snapshot.
    pub fn snapshot(&self) -> MetadataSnapshot {
        let mut segments: Vec<SegmentMetadata> = self.segments.values().cloned().collect();
        segments.sort_by_key(|s| s.segment_id);
        MetadataSnapshot {
            next_segment_id: self.next_segment_id,
            segments,
        }
    }

    /// JSON-encoded [`MetadataSnapshot`], used as checkpoint contents.
    pub fn checkpoint_contents(&self) -> Result<Vec<u8>, MetadataError> {
        Ok(serde_json::to_vec(&self.snapshot())?)
    }

    /// Map operation for a new, empty segment under the next free id.
    pub fn new_segment_operation(&self, name: impl Into<String>) -> Operation {
        Operation::map_segment(self.next_segment_id, name, 0, false)
    }

    fn restore(&mut self, snapshot: MetadataSnapshot) {
        self.next_segment_id = snapshot.next_segment_id;
        self.segments = snapshot
            .segments
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
    }

    fn segment(&self, name: &str) -> Result<&SegmentMetadata, MetadataError> {
        self.segments
            .get(name)
            .ok_or_else(|| MetadataError::SegmentNotFound(name.to_string()))
    }

    fn writable(&self, name: &str) -> Result<&SegmentMetadata, MetadataError> {
        let segment = self.segment(name)?;
        if segment.merged {
            return Err(MetadataError::SegmentMerged(name.to_string()));
        }
        if segment.sealed {
            return Err(MetadataError::SegmentSealed(name.to_string()));
        }
        Ok(segment)
    }

    /// Checks `operation` against current state without changing anything.
    pub fn validate(&self, operation: &Operation) -> Result<(), MetadataError> {
        match operation.state() {
            OperationState::Unsequenced => return Err(OperationError::NotSequenced.into()),
            OperationState::AwaitingConfiguration(missing) => {
                return Err(OperationError::NotConfigured { missing }.into());
            }
            OperationState::Ready => {}
        }

        match operation.kind() {
            OperationKind::Append(op) => {
                let segment = self.writable(op.segment_name())?;
                expect_offset(segment, configured(op.offset(), FieldKind::Offset)?)?;
                grown_length(segment, op.data().len() as u64).map(drop)
            }
            OperationKind::Seal(op) => {
                let segment = self.writable(op.segment_name())?;
                expect_length(segment, configured(op.length(), FieldKind::Length)?)
            }
            OperationKind::Merge(op) => {
                if op.target_segment() == op.source_segment() {
                    return Err(MetadataError::SelfMerge(op.target_segment().to_string()));
                }
                let target = self.writable(op.target_segment())?;
                let source = self.segment(op.source_segment())?;
                if source.merged {
                    return Err(MetadataError::SegmentMerged(source.name.clone()));
                }
                if !source.sealed {
                    return Err(MetadataError::SourceNotSealed(source.name.clone()));
                }
                let length = configured(op.length(), FieldKind::Length)?;
                expect_length(source, length)?;
                expect_offset(target, configured(op.target_offset(), FieldKind::Offset)?)?;
                grown_length(target, length as u64).map(drop)
            }
            OperationKind::MapSegment(op) => {
                if self.segments.contains_key(op.segment_name()) {
                    return Err(MetadataError::AlreadyMapped(op.segment_name().to_string()));
                }
                if self.segments.values().any(|s| s.segment_id == op.segment_id()) {
                    return Err(MetadataError::SegmentIdInUse(op.segment_id()));
                }
                Ok(())
            }
            OperationKind::MetadataCheckpoint(op) => {
                let contents = configured(op.contents(), FieldKind::Contents)?;
                serde_json::from_slice::<MetadataSnapshot>(contents)?;
                Ok(())
            }
        }
    }

    /// Validates and applies `operation`.
    pub fn apply(&mut self, operation: &Operation) -> Result<(), MetadataError> {
        self.validate(operation)?;

        match operation.kind() {
            OperationKind::Append(op) => {
                if let Some(segment) = self.segments.get_mut(op.segment_name()) {
                    segment.length = grown_length(segment, op.data().len() as u64)?;
                }
            }
            OperationKind::Seal(op) => {
                if let Some(segment) = self.segments.get_mut(op.segment_name()) {
                    segment.sealed = true;
                }
            }
            OperationKind::Merge(op) => {
                let length = configured(op.length(), FieldKind::Length)?;
                if let Some(target) = self.segments.get_mut(op.target_segment()) {
                    target.length = grown_length(target, length as u64)?;
                }
                if let Some(source) = self.segments.get_mut(op.source_segment()) {
                    source.merged = true;
                }
            }
            OperationKind::MapSegment(op) => {
                self.next_segment_id = self.next_segment_id.max(op.segment_id().saturating_add(1));
                self.segments.insert(
                    op.segment_name().to_string(),
                    SegmentMetadata {
                        segment_id: op.segment_id(),
                        name: op.segment_name().to_string(),
                        length: op.length(),
                        sealed: op.sealed(),
                        merged: false,
                    },
                );
            }
            OperationKind::MetadataCheckpoint(op) => {
                let contents = configured(op.contents(), FieldKind::Contents)?;
                self.restore(serde_json::from_slice(contents)?);
            }
        }

        self.last_sequence_number = self.last_sequence_number.max(operation.sequence_number());
        Ok(())
    }
}

fn configured<T>(value: Option<T>, missing: FieldKind) -> Result<T, MetadataError> {
    value.ok_or(MetadataError::Operation(OperationError::NotConfigured { missing }))
}

fn grown_length(segment: &SegmentMetadata, by: u64) -> Result<i64, MetadataError> {
    i64::try_from(by)
        .ok()
        .and_then(|by| segment.length.checked_add(by))
        .ok_or_else(|| MetadataError::LengthOverflow(segment.name.clone()))
}

fn expect_offset(segment: &SegmentMetadata, actual: i64) -> Result<(), MetadataError> {
    if segment.length != actual {
        return Err(MetadataError::OffsetMismatch {
            segment: segment.name.clone(),
            expected: segment.length,
            actual,
        });
    }
    Ok(())
}

fn expect_length(segment: &SegmentMetadata, actual: i64) -> Result<(), MetadataError> {
    if segment.length != actual {
        return Err(MetadataError::LengthMismatch {
            segment: segment.name.clone(),
            expected: segment.length,
            actual,
        });
    }
    Ok(())
}

/// Supplies deferred fields from the current tail of each segment.
pub struct MetadataConfigurator<'a> {
    metadata: &'a ContainerMetadata,
}

impl<'a> MetadataConfigurator<'a> {
    /// Configurator reading from `metadata`.
    pub fn new(metadata: &'a ContainerMetadata) -> Self {
        Self { metadata }
    }
}

impl PreSerializationConfigurator for MetadataConfigurator<'_> {
    type Error = MetadataError;

    fn supply(&mut self, operation: &Operation, field: FieldKind) -> Result<DeferredValue, MetadataError> {
        match (operation.kind(), field) {
            (OperationKind::Append(op), FieldKind::Offset) => {
                Ok(DeferredValue::Offset(self.metadata.segment(op.segment_name())?.length))
            }
            (OperationKind::Seal(op), FieldKind::Length) => {
                Ok(DeferredValue::Length(self.metadata.segment(op.segment_name())?.length))
            }
            (OperationKind::Merge(op), FieldKind::Length) => {
                Ok(DeferredValue::Length(self.metadata.segment(op.source_segment())?.length))
            }
            (OperationKind::Merge(op), FieldKind::Offset) => {
                Ok(DeferredValue::Offset(self.metadata.segment(op.target_segment())?.length))
            }
            (OperationKind::MetadataCheckpoint(_), FieldKind::Contents) => {
                Ok(DeferredValue::Contents(self.metadata.checkpoint_contents()?))
            }
            (_, field) => Err(MetadataError::UnsupportedField {
                op_type: operation.operation_type(),
                field,
            }),
        }
    }
}
