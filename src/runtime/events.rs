//! Runtime event stream payloads.

use crate::{op::OperationType, types::SeqNo};

/// Events emitted from the single-writer runtime loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// An operation passed the write path and was queued for persistence.
    Committed {
        /// Assigned sequence number.
        seq: SeqNo,
        /// Operation type.
        op_type: OperationType,
    },
    /// A metadata checkpoint was written.
    Checkpointed {
        /// Checkpoint sequence number.
        seq: SeqNo,
    },
    /// Persistence has reached at least this sequence number.
    DurableUpTo {
        /// Highest sequence known durable.
        seq: SeqNo,
    },
    /// The durable log rejected a batch.
    PersistFailed {
        /// Rendered error.
        message: String,
    },
}
