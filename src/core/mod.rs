//! Sequencing, segment metadata and the synchronous write path.

/// Container metadata and the metadata-backed configurator.
pub mod metadata;
/// Single-writer write path tying the pieces together.
pub mod oplog;
/// Monotonic sequence number source.
pub mod sequencer;
