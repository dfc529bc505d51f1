use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{NO_SEQUENCE_NUMBER, SeqNo};

use super::{LogSink, PersistError, PersistResult, SerializedRecord};

/// Shared in-memory log. Clones see the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    records: Arc<Mutex<Vec<SerializedRecord>>>,
}

impl MemoryLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record, in append order.
    pub fn records(&self) -> Vec<SerializedRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stored payloads, in append order.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.records().into_iter().map(|r| r.payload).collect()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for MemoryLog {
    fn append_records(&mut self, records: &[SerializedRecord]) -> PersistResult<SeqNo> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| PersistError::Message("memory log lock poisoned".to_string()))?;

        let mut last = stored.last().map_or(NO_SEQUENCE_NUMBER, |r| r.sequence_number);
        for record in records {
            if record.sequence_number <= last {
                return Err(PersistError::OutOfOrder {
                    seq: record.sequence_number,
                    last,
                });
            }
            last = record.sequence_number;
        }

        stored.extend_from_slice(records);
        Ok(last)
    }

    fn truncate_before(&mut self, seq: SeqNo) -> PersistResult<usize> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| PersistError::Message("memory log lock poisoned".to_string()))?;
        let before = stored.len();
        stored.retain(|r| r.sequence_number >= seq);
        Ok(before - stored.len())
    }
}
