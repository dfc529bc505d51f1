//! Tag-dispatched decoding of serialized operations.

use thiserror::Error;

use crate::op::{
    Operation, OperationError, OperationKind, OperationType,
    variants::{
        AppendOperation, MapSegmentOperation, MergeOperation, MetadataCheckpointOperation,
        OperationPayload, SealOperation,
    },
};

use super::{DecodeError, RecordReader};

/// Failure of [`verify_round_trip`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoundTripError {
    /// Operation could not be serialized.
    #[error("serialize failed: {0}")]
    Serialize(#[from] OperationError),
    /// Serialized bytes could not be decoded.
    #[error("deserialize failed: {0}")]
    Deserialize(#[from] DecodeError),
    /// Decoded operation differs from the original.
    #[error("round trip changed `{field}`")]
    Mismatch {
        /// First differing field.
        field: &'static str,
    },
}

/// Rebuilds operations from their byte form.
#[derive(Debug, Clone, Copy, Default)]
pub struct OperationFactory;

impl OperationFactory {
    /// New factory.
    pub fn new() -> Self {
        Self
    }

    /// Decodes exactly one record; any bytes after it are an error.
    pub fn deserialize(&self, bytes: &[u8]) -> Result<Operation, DecodeError> {
        let mut src = bytes;
        let op = self.read_next(&mut src)?;
        if !src.is_empty() {
            return Err(DecodeError::TrailingBytes(src.len()));
        }
        Ok(op)
    }

    /// Decodes the record at the front of `src` and advances past it.
    /// On error `src` is left untouched.
    pub fn read_next(&self, src: &mut &[u8]) -> Result<Operation, DecodeError> {
        let mut r = RecordReader::new(*src);
        let tag = r.get_u8("operation_type")?;
        let ty = OperationType::from_tag(tag).ok_or(DecodeError::UnknownType(tag))?;
        let sequence_number = r.get_non_negative("sequence_number")?;
        let kind = match ty {
            OperationType::Append => OperationKind::Append(AppendOperation::decode(&mut r)?),
            OperationType::Seal => OperationKind::Seal(SealOperation::decode(&mut r)?),
            OperationType::Merge => OperationKind::Merge(MergeOperation::decode(&mut r)?),
            OperationType::MapSegment => {
                OperationKind::MapSegment(MapSegmentOperation::decode(&mut r)?)
            }
            OperationType::MetadataCheckpoint => {
                OperationKind::MetadataCheckpoint(MetadataCheckpointOperation::decode(&mut r)?)
            }
        };
        *src = r.rest();
        Ok(Operation::from_parts(sequence_number, kind))
    }

    /// Decodes a concatenation of records.
    pub fn read_all(&self, mut bytes: &[u8]) -> Result<Vec<Operation>, DecodeError> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            out.push(self.read_next(&mut bytes)?);
        }
        Ok(out)
    }
}

/// Serializes `operation`, decodes the bytes and checks the result matches.
pub fn verify_round_trip(operation: &Operation) -> Result<Operation, RoundTripError> {
    let bytes = operation.serialize()?;
    let decoded = OperationFactory::new().deserialize(&bytes)?;
    match operation.first_mismatch(&decoded) {
        Some(field) => Err(RoundTripError::Mismatch { field }),
        None => Ok(decoded),
    }
}
