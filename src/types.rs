//! Shared primitive IDs, sentinels and limits.

/// Operation sequence number. Negative values mean "not assigned".
pub type SeqNo = i64;
/// Stable numeric segment identifier.
pub type SegmentId = u64;

/// Sequence number carried by an operation that has not been sequenced yet.
pub const NO_SEQUENCE_NUMBER: SeqNo = -1;

/// Largest encodable segment name, in UTF-8 bytes.
pub const MAX_SEGMENT_NAME_LENGTH: usize = u16::MAX as usize;

/// Largest encodable raw payload (append data, checkpoint contents).
pub const MAX_PAYLOAD_LENGTH: usize = u32::MAX as usize;
