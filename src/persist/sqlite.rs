//! SQLite-backed append-only operation log.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;

use crate::{
    core::metadata::ContainerMetadata,
    recovery::{RecoveryError, RecoveryReport, recover},
    types::{NO_SEQUENCE_NUMBER, SeqNo},
};

use super::{LogSink, PersistError, PersistResult, SerializedRecord};

/// SQLite implementation of [`crate::persist::LogSink`].
pub struct SqliteLog {
    conn: Connection,
}

impl SqliteLog {
    /// Opens or creates a SQLite-backed log at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> PersistResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens an in-memory SQLite log.
    pub fn open_in_memory() -> PersistResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> PersistResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self { conn })
    }

    /// Replays every stored record into fresh container metadata.
    pub fn load_metadata(&self) -> Result<(ContainerMetadata, RecoveryReport), RecoveryError> {
        let records = self.read_records_after(NO_SEQUENCE_NUMBER)?;
        recover(records)
    }

    /// Loads records strictly after `seq`, in sequence order.
    pub fn read_records_after(&self, seq: SeqNo) -> PersistResult<Vec<SerializedRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT seq, payload FROM operations WHERE seq > ?1 ORDER BY seq ASC")?;

        let rows = stmt.query_map(params![seq], |row| {
            Ok(SerializedRecord {
                sequence_number: row.get(0)?,
                payload: row.get(1)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Returns the latest sequence stored, or [`NO_SEQUENCE_NUMBER`].
    pub fn latest_seq(&self) -> PersistResult<SeqNo> {
        let seq: Option<i64> = self
            .conn
            .query_row("SELECT MAX(seq) FROM operations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten();
        Ok(seq.unwrap_or(NO_SEQUENCE_NUMBER))
    }
}

impl LogSink for SqliteLog {
    fn append_records(&mut self, records: &[SerializedRecord]) -> PersistResult<SeqNo> {
        let mut last = self.latest_seq()?;
        for record in records {
            if record.sequence_number <= last {
                return Err(PersistError::OutOfOrder {
                    seq: record.sequence_number,
                    last,
                });
            }
            last = record.sequence_number;
        }
        if records.is_empty() {
            return Ok(last);
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO operations(seq, op_type, payload) VALUES (?1, ?2, ?3)")?;
            for record in records {
                let op_type = record.payload.first().copied().unwrap_or_default();
                stmt.execute(params![record.sequence_number, op_type, record.payload])?;
            }
        }
        tx.commit()?;

        debug!(count = records.len(), last, "appended records");
        Ok(last)
    }

    fn flush(&mut self) -> PersistResult<()> {
        self.conn.execute_batch("PRAGMA wal_checkpoint(PASSIVE);")?;
        Ok(())
    }

    fn truncate_before(&mut self, seq: SeqNo) -> PersistResult<usize> {
        let count = self
            .conn
            .execute("DELETE FROM operations WHERE seq < ?1", params![seq])?;
        Ok(count)
    }
}
