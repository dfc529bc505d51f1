//! Variant payloads. Each declares its tag, field order and deferred fields.

use crate::{
    codec::{DecodeError, RecordReader, RecordWriter},
    types::SegmentId,
};

use super::{
    OperationError, OperationType,
    config::{DeferredValue, FieldKind},
};

/// Contract every variant payload implements.
pub trait OperationPayload: Sized {
    /// Wire tag.
    const TYPE: OperationType;

    /// Next deferred field still missing, in the order the variant wants them.
    fn pending_field(&self) -> Option<FieldKind>;

    /// Sets the pending field from `value`.
    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError>;

    /// Writes payload fields in wire order. Callers check readiness first.
    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError>;

    /// Reads payload fields in the order [`Self::encode`] wrote them.
    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError>;

    /// Name of the first wire field that differs from `other`.
    fn mismatch(&self, other: &Self) -> Option<&'static str>;
}

fn unexpected(value: &DeferredValue, pending: Option<FieldKind>) -> OperationError {
    OperationError::UnexpectedField {
        supplied: value.kind(),
        pending,
    }
}

fn require<T: Copy>(value: Option<T>, missing: FieldKind) -> Result<T, OperationError> {
    value.ok_or(OperationError::NotConfigured { missing })
}

/// Data appended to the tail of a segment.
#[derive(Debug, Clone)]
pub struct AppendOperation {
    segment_name: String,
    offset: Option<i64>,
    data: Vec<u8>,
}

impl AppendOperation {
    /// New append with the offset still unknown.
    pub fn new(segment_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            segment_name: segment_name.into(),
            offset: None,
            data: data.into(),
        }
    }

    /// Target segment.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Offset at which the data lands, once configured.
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Appended bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl OperationPayload for AppendOperation {
    const TYPE: OperationType = OperationType::Append;

    fn pending_field(&self) -> Option<FieldKind> {
        self.offset.is_none().then_some(FieldKind::Offset)
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        match (&value, self.pending_field()) {
            (DeferredValue::Offset(offset), Some(FieldKind::Offset)) => {
                self.offset = Some(*offset);
                Ok(())
            }
            (_, pending) => Err(unexpected(&value, pending)),
        }
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        let offset = require(self.offset, FieldKind::Offset)?;
        w.put_str("segment_name", &self.segment_name)?;
        w.put_i64(offset);
        w.put_bytes("data", &self.data)
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            segment_name: r.get_str("segment_name")?,
            offset: Some(r.get_non_negative("offset")?),
            data: r.get_bytes("data")?,
        })
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        if self.segment_name != other.segment_name {
            Some("segment_name")
        } else if self.offset != other.offset {
            Some("offset")
        } else if self.data != other.data {
            Some("data")
        } else {
            None
        }
    }
}

/// Segment closed to further appends at a known length.
#[derive(Debug, Clone)]
pub struct SealOperation {
    segment_name: String,
    length: Option<i64>,
}

impl SealOperation {
    /// New seal with the final length still unknown.
    pub fn new(segment_name: impl Into<String>) -> Self {
        Self {
            segment_name: segment_name.into(),
            length: None,
        }
    }

    /// Sealed segment.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Length at seal time, once configured.
    pub fn length(&self) -> Option<i64> {
        self.length
    }
}

impl OperationPayload for SealOperation {
    const TYPE: OperationType = OperationType::Seal;

    fn pending_field(&self) -> Option<FieldKind> {
        self.length.is_none().then_some(FieldKind::Length)
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        match (&value, self.pending_field()) {
            (DeferredValue::Length(length), Some(FieldKind::Length)) => {
                self.length = Some(*length);
                Ok(())
            }
            (_, pending) => Err(unexpected(&value, pending)),
        }
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        let length = require(self.length, FieldKind::Length)?;
        w.put_str("segment_name", &self.segment_name)?;
        w.put_i64(length);
        Ok(())
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            segment_name: r.get_str("segment_name")?,
            length: Some(r.get_non_negative("length")?),
        })
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        if self.segment_name != other.segment_name {
            Some("segment_name")
        } else if self.length != other.length {
            Some("length")
        } else {
            None
        }
    }
}

/// Sealed source segment concatenated onto the end of a target segment.
///
/// Needs two deferred fields: the source length, then the target offset.
#[derive(Debug, Clone)]
pub struct MergeOperation {
    target_segment: String,
    source_segment: String,
    length: Option<i64>,
    target_offset: Option<i64>,
}

impl MergeOperation {
    /// New merge with length and target offset still unknown.
    pub fn new(target_segment: impl Into<String>, source_segment: impl Into<String>) -> Self {
        Self {
            target_segment: target_segment.into(),
            source_segment: source_segment.into(),
            length: None,
            target_offset: None,
        }
    }

    /// Segment receiving the data.
    pub fn target_segment(&self) -> &str {
        &self.target_segment
    }

    /// Segment being merged away.
    pub fn source_segment(&self) -> &str {
        &self.source_segment
    }

    /// Source length, once configured.
    pub fn length(&self) -> Option<i64> {
        self.length
    }

    /// Target offset at which the source lands, once configured.
    pub fn target_offset(&self) -> Option<i64> {
        self.target_offset
    }
}

impl OperationPayload for MergeOperation {
    const TYPE: OperationType = OperationType::Merge;

    fn pending_field(&self) -> Option<FieldKind> {
        if self.length.is_none() {
            Some(FieldKind::Length)
        } else if self.target_offset.is_none() {
            Some(FieldKind::Offset)
        } else {
            None
        }
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        match (&value, self.pending_field()) {
            (DeferredValue::Length(length), Some(FieldKind::Length)) => {
                self.length = Some(*length);
                Ok(())
            }
            (DeferredValue::Offset(offset), Some(FieldKind::Offset)) => {
                self.target_offset = Some(*offset);
                Ok(())
            }
            (_, pending) => Err(unexpected(&value, pending)),
        }
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        let length = require(self.length, FieldKind::Length)?;
        let target_offset = require(self.target_offset, FieldKind::Offset)?;
        w.put_str("target_segment", &self.target_segment)?;
        w.put_str("source_segment", &self.source_segment)?;
        w.put_i64(length);
        w.put_i64(target_offset);
        Ok(())
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            target_segment: r.get_str("target_segment")?,
            source_segment: r.get_str("source_segment")?,
            length: Some(r.get_non_negative("length")?),
            target_offset: Some(r.get_non_negative("target_offset")?),
        })
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        if self.target_segment != other.target_segment {
            Some("target_segment")
        } else if self.source_segment != other.source_segment {
            Some("source_segment")
        } else if self.length != other.length {
            Some("length")
        } else if self.target_offset != other.target_offset {
            Some("target_offset")
        } else {
            None
        }
    }
}

/// Binds a segment name to an id, carrying its state at mapping time.
#[derive(Debug, Clone)]
pub struct MapSegmentOperation {
    segment_id: SegmentId,
    segment_name: String,
    length: i64,
    sealed: bool,
}

impl MapSegmentOperation {
    /// Fully specified mapping; nothing is deferred.
    pub fn new(segment_id: SegmentId, segment_name: impl Into<String>, length: i64, sealed: bool) -> Self {
        Self {
            segment_id,
            segment_name: segment_name.into(),
            length,
            sealed,
        }
    }

    /// Assigned segment id.
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    /// Mapped name.
    pub fn segment_name(&self) -> &str {
        &self.segment_name
    }

    /// Segment length at mapping time.
    pub fn length(&self) -> i64 {
        self.length
    }

    /// Whether the segment was already sealed.
    pub fn sealed(&self) -> bool {
        self.sealed
    }
}

impl OperationPayload for MapSegmentOperation {
    const TYPE: OperationType = OperationType::MapSegment;

    fn pending_field(&self) -> Option<FieldKind> {
        None
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        Err(unexpected(&value, None))
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        if self.length < 0 {
            return Err(OperationError::NegativeValue {
                field: FieldKind::Length,
                value: self.length,
            });
        }
        w.put_u64(self.segment_id);
        w.put_str("segment_name", &self.segment_name)?;
        w.put_i64(self.length);
        w.put_bool(self.sealed);
        Ok(())
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            segment_id: r.get_u64("segment_id")?,
            segment_name: r.get_str("segment_name")?,
            length: r.get_non_negative("length")?,
            sealed: r.get_bool("sealed")?,
        })
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        if self.segment_id != other.segment_id {
            Some("segment_id")
        } else if self.segment_name != other.segment_name {
            Some("segment_name")
        } else if self.length != other.length {
            Some("length")
        } else if self.sealed != other.sealed {
            Some("sealed")
        } else {
            None
        }
    }
}

/// Point-in-time snapshot of container metadata.
#[derive(Debug, Clone, Default)]
pub struct MetadataCheckpointOperation {
    contents: Option<Vec<u8>>,
}

impl MetadataCheckpointOperation {
    /// New checkpoint with contents still unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialized snapshot, once configured.
    pub fn contents(&self) -> Option<&[u8]> {
        self.contents.as_deref()
    }
}

impl OperationPayload for MetadataCheckpointOperation {
    const TYPE: OperationType = OperationType::MetadataCheckpoint;

    fn pending_field(&self) -> Option<FieldKind> {
        self.contents.is_none().then_some(FieldKind::Contents)
    }

    fn configure(&mut self, value: DeferredValue) -> Result<(), OperationError> {
        match (value, self.pending_field()) {
            (DeferredValue::Contents(contents), Some(FieldKind::Contents)) => {
                self.contents = Some(contents);
                Ok(())
            }
            (value, pending) => Err(unexpected(&value, pending)),
        }
    }

    fn encode(&self, w: &mut RecordWriter<'_>) -> Result<(), OperationError> {
        let contents = self
            .contents
            .as_deref()
            .ok_or(OperationError::NotConfigured {
                missing: FieldKind::Contents,
            })?;
        w.put_bytes("contents", contents)
    }

    fn decode(r: &mut RecordReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            contents: Some(r.get_bytes("contents")?),
        })
    }

    fn mismatch(&self, other: &Self) -> Option<&'static str> {
        (self.contents != other.contents).then_some("contents")
    }
}
