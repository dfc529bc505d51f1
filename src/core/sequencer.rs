//! Monotonic sequence number assignment.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::debug;

use crate::{
    op::{Operation, OperationError},
    types::SeqNo,
};

const EXHAUSTED: SeqNo = -1;

/// Issues monotonically increasing sequence numbers, each at most once.
///
/// Safe to share between producer threads; ordering of records toward the
/// log is still the owning pipeline's job.
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicI64,
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl Sequencer {
    /// Sequencer whose first issued number is `0`.
    pub fn new() -> Self {
        Self {
            next: AtomicI64::new(0),
        }
    }

    /// Sequencer whose first issued number is `first`, e.g. one past the
    /// last number seen during recovery.
    pub fn starting_at(first: SeqNo) -> Result<Self, OperationError> {
        if first < 0 {
            return Err(OperationError::InvalidSequenceNumber(first));
        }
        Ok(Self {
            next: AtomicI64::new(first),
        })
    }

    /// Number the next successful [`Self::assign`] will issue, or `None`
    /// once exhausted.
    pub fn peek_next(&self) -> Option<SeqNo> {
        let next = self.next.load(Ordering::Acquire);
        (next >= 0).then_some(next)
    }

    /// Assigns the next sequence number to `operation`.
    ///
    /// Fails without consuming a number if the operation is already
    /// sequenced.
    pub fn assign(&self, operation: &mut Operation) -> Result<SeqNo, OperationError> {
        if operation.is_sequenced() {
            return Err(OperationError::AlreadySequenced {
                existing: operation.sequence_number(),
            });
        }
        let seq = self
            .next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next >= 0).then(|| next.checked_add(1).unwrap_or(EXHAUSTED))
            })
            .map_err(|_| OperationError::SequenceExhausted)?;
        operation.set_sequence_number(seq)?;
        debug!(seq, op_type = ?operation.operation_type(), "sequenced operation");
        Ok(seq)
    }
}
