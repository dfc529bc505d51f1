//! Durable operation log for stream segments: typed, sequenced records with
//! a self-delimiting binary encoding and deterministic decoding.
//!
//! # Examples
//!
//! Building, sequencing, configuring and round-tripping one operation:
//! ```
//! use seglog::{
//!     codec::factory::OperationFactory,
//!     core::sequencer::Sequencer,
//!     op::{Operation, OperationType, config::DeferredValue},
//! };
//!
//! let sequencer = Sequencer::starting_at(77).expect("sequencer");
//! let mut op = Operation::append("StreamSegment_42", b"payload".to_vec());
//! assert!(op.serialize().is_err());
//!
//! sequencer.assign(&mut op).expect("assign");
//! op.configure(DeferredValue::Offset(1024)).expect("configure");
//! let bytes = op.serialize().expect("serialize");
//!
//! let decoded = OperationFactory::new().deserialize(&bytes).expect("deserialize");
//! assert_eq!(decoded.operation_type(), OperationType::Append);
//! assert!(decoded.matches(&op));
//! ```
//!
//! Runtime usage with a SQLite log:
//! ```no_run
//! use seglog::{
//!     core::oplog::OperationLog,
//!     op::Operation,
//!     persist::sqlite::SqliteLog,
//!     runtime::handle::{spawn_operation_log, RuntimeConfig},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let sink = SqliteLog::open("segments.db").expect("open sqlite");
//! let (metadata, _report) = sink.load_metadata().expect("recover");
//! let log = OperationLog::recovered(metadata).expect("resume");
//! let handle = spawn_operation_log(log, Some(Box::new(sink)), RuntimeConfig::default());
//! handle.create_segment("StreamSegment_1").await.expect("map");
//! handle
//!     .submit(Operation::append("StreamSegment_1", b"hello".to_vec()))
//!     .await
//!     .expect("append");
//! handle.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Field-level codec primitives and the operation factory.
pub mod codec;
/// Sequencer, container metadata and write path.
pub mod core;
/// Operation model, variants and configuration protocol.
pub mod op;
/// Durable log abstraction with in-memory and SQLite implementations.
pub mod persist;
/// Replay of serialized operations.
pub mod recovery;
/// Single-writer runtime handle and events.
pub mod runtime;
/// Shared primitive types and limits.
pub mod types;
