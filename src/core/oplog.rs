//! Synchronous write path over container metadata.

use tracing::debug;

use crate::{
    op::{Operation, config::configure_until_ready},
    persist::SerializedRecord,
    types::SeqNo,
};

use super::{
    metadata::{ContainerMetadata, MetadataConfigurator, MetadataError},
    sequencer::Sequencer,
};

/// Single-writer write path: sequence, configure, validate, serialize,
/// then apply to metadata.
#[derive(Debug, Default)]
pub struct OperationLog {
    metadata: ContainerMetadata,
    sequencer: Sequencer,
}

impl OperationLog {
    /// Empty log whose first operation gets sequence number 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Continues after recovered `metadata`, sequencing from one past the
    /// last replayed number.
    pub fn recovered(metadata: ContainerMetadata) -> Result<Self, MetadataError> {
        let next = metadata.last_sequence_number().saturating_add(1).max(0);
        Ok(Self {
            metadata,
            sequencer: Sequencer::starting_at(next)?,
        })
    }

    /// Current container metadata.
    pub fn metadata(&self) -> &ContainerMetadata {
        &self.metadata
    }

    /// Number the next accepted operation receives.
    pub fn next_sequence_number(&self) -> Option<SeqNo> {
        self.sequencer.peek_next()
    }

    /// Runs `operation` through the write path and returns its bytes.
    ///
    /// If validation fails after sequencing, the number is burned and the
    /// log shows a gap.
    pub fn submit(&mut self, mut operation: Operation) -> Result<SerializedRecord, MetadataError> {
        let seq = self.sequencer.assign(&mut operation)?;
        let steps = configure_until_ready(&mut operation, &mut MetadataConfigurator::new(&self.metadata))?;
        self.metadata.validate(&operation)?;
        let record = SerializedRecord::from_operation(&operation)?;
        self.metadata.apply(&operation)?;
        debug!(
            seq,
            steps,
            op_type = ?operation.operation_type(),
            bytes = record.payload.len(),
            "operation committed"
        );
        Ok(record)
    }

    /// Maps a new, empty segment named `name`.
    pub fn create_segment(&mut self, name: impl Into<String>) -> Result<SerializedRecord, MetadataError> {
        let operation = self.metadata.new_segment_operation(name);
        self.submit(operation)
    }

    /// Writes a metadata checkpoint.
    pub fn checkpoint(&mut self) -> Result<SerializedRecord, MetadataError> {
        self.submit(Operation::metadata_checkpoint())
    }
}
