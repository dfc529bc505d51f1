/// In-memory log used by tests and embedders without a database.
pub mod memory;
/// SQLite-backed append-only log.
pub mod sqlite;

use thiserror::Error;

use crate::{
    op::{Operation, OperationError},
    types::SeqNo,
};

/// Failure in a durable log implementation.
#[derive(Debug, Error)]
pub enum PersistError {
    /// SQLite error.
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// Record would not extend the log in sequence order.
    #[error("record {seq} does not follow {last}")]
    OutOfOrder {
        /// Offered sequence number.
        seq: SeqNo,
        /// Last sequence number in the log.
        last: SeqNo,
    },
    /// Records are held back because an earlier append failed.
    #[error("{pending} records not yet durable after {last_durable}: {reason}")]
    Stalled {
        /// Records waiting to be written, in sequence order.
        pending: usize,
        /// Highest sequence number known durable.
        last_durable: SeqNo,
        /// Rendered error of the last failed append.
        reason: String,
    },
    /// Anything else, e.g. a failed worker join.
    #[error("{0}")]
    Message(String),
}

/// Result alias for persistence calls.
pub type PersistResult<T> = Result<T, PersistError>;

/// Serialized operation as handed to, and returned from, the durable log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedRecord {
    /// Sequence number of the encoded operation.
    pub sequence_number: SeqNo,
    /// Encoded operation.
    pub payload: Vec<u8>,
}

impl SerializedRecord {
    /// Serializes `operation`; fails if it is not ready.
    pub fn from_operation(operation: &Operation) -> Result<Self, OperationError> {
        Ok(Self {
            sequence_number: operation.sequence_number(),
            payload: operation.serialize()?,
        })
    }
}

/// Append-only destination for serialized operations.
///
/// Implementations must keep records in the order given and return them
/// byte-for-byte on read. A failed `append_records` must store none of the
/// batch; the caller retries the same records.
pub trait LogSink: Send {
    /// Appends `records` in order and returns the last sequence number now
    /// stored.
    fn append_records(&mut self, records: &[SerializedRecord]) -> PersistResult<SeqNo>;

    /// Makes previously appended records durable.
    fn flush(&mut self) -> PersistResult<()> {
        Ok(())
    }

    /// Drops records with a sequence number below `seq`.
    fn truncate_before(&mut self, _seq: SeqNo) -> PersistResult<usize> {
        Ok(0)
    }
}
