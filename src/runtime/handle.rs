//! Single-writer runtime: command loop, batching persistence worker and
//! the cloneable handle in front of them.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, oneshot},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    core::{
        metadata::{MetadataError, SegmentMetadata},
        oplog::OperationLog,
    },
    op::{Operation, OperationType},
    persist::{LogSink, PersistError, SerializedRecord},
    types::{NO_SEQUENCE_NUMBER, SeqNo},
};

use super::events::LogEvent;

/// Failure reported to a caller of [`OperationLogHandle`].
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Operation rejected on the write path.
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    /// Durable log failure.
    #[error(transparent)]
    Persist(#[from] PersistError),
    /// Runtime task has stopped.
    #[error("operation log runtime is not running")]
    ChannelClosed,
}

/// Runtime tuning. Every field has a default, so partial JSON is accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Persist seal and merge records without waiting for a full batch.
    pub flush_on_seal: bool,
    /// Records per persistence batch.
    pub batch_max_ops: usize,
    /// Longest a non-empty batch waits before being written.
    pub batch_max_latency_ms: u64,
    /// Capacity of the queue toward the persistence worker.
    pub persist_queue_bound: usize,
    /// Write a metadata checkpoint after this many operations; 0 disables.
    pub checkpoint_every_ops: usize,
    /// Drop records older than each new checkpoint.
    pub truncate_after_checkpoint: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            flush_on_seal: true,
            batch_max_ops: 32,
            batch_max_latency_ms: 75,
            persist_queue_bound: 64,
            checkpoint_every_ops: 2000,
            truncate_after_checkpoint: false,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON object; missing fields keep their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Cloneable handle to the single-writer runtime.
#[derive(Clone)]
pub struct OperationLogHandle {
    cmd_tx: mpsc::Sender<Command>,
    events_tx: broadcast::Sender<LogEvent>,
}

enum Command {
    Submit {
        operation: Operation,
        resp: oneshot::Sender<Result<SeqNo, RuntimeError>>,
    },
    CreateSegment {
        name: String,
        resp: oneshot::Sender<Result<SeqNo, RuntimeError>>,
    },
    Segment {
        name: String,
        resp: oneshot::Sender<Option<SegmentMetadata>>,
    },
    Flush {
        resp: oneshot::Sender<Result<SeqNo, RuntimeError>>,
    },
    Checkpoint {
        resp: oneshot::Sender<Result<SeqNo, RuntimeError>>,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

enum PersistMsg {
    Record {
        record: SerializedRecord,
        urgent: bool,
    },
    Flush {
        resp: oneshot::Sender<Result<SeqNo, PersistError>>,
    },
    Truncate {
        before: SeqNo,
    },
    Shutdown {
        resp: oneshot::Sender<Result<(), PersistError>>,
    },
}

/// Starts the runtime loop around `log`, persisting to `sink` when given.
pub fn spawn_operation_log(
    log: OperationLog,
    sink: Option<Box<dyn LogSink>>,
    config: RuntimeConfig,
) -> OperationLogHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(256);
    let (events_tx, _) = broadcast::channel::<LogEvent>(1024);

    let (persist_tx, mut durable_rx) = if let Some(sink) = sink {
        let (persist_tx, persist_rx) = mpsc::channel::<PersistMsg>(config.persist_queue_bound.max(1));
        let (durable_tx, durable_rx) = mpsc::unbounded_channel::<Result<SeqNo, PersistError>>();
        spawn_persistence_worker(sink, persist_rx, durable_tx, config.clone());
        (Some(persist_tx), Some(durable_rx))
    } else {
        (None, None)
    };

    let mut writer = Writer {
        log,
        events_tx: events_tx.clone(),
        persist_tx,
        config,
        ops_since_checkpoint: 0,
    };

    tokio::spawn(async move {
        let mut durable_open = durable_rx.is_some();
        loop {
            match durable_rx.as_mut() {
                Some(rx) if durable_open => {
                    tokio::select! {
                        cmd = cmd_rx.recv() => {
                            let Some(cmd) = cmd else { break; };
                            if writer.handle_command(cmd).await {
                                break;
                            }
                        }
                        durable = rx.recv() => {
                            match durable {
                                Some(Ok(seq)) => {
                                    let _ = writer.events_tx.send(LogEvent::DurableUpTo { seq });
                                }
                                Some(Err(err)) => {
                                    let _ = writer.events_tx.send(LogEvent::PersistFailed {
                                        message: err.to_string(),
                                    });
                                }
                                None => durable_open = false,
                            }
                        }
                    }
                }
                _ => {
                    let Some(cmd) = cmd_rx.recv().await else { break; };
                    if writer.handle_command(cmd).await {
                        break;
                    }
                }
            }
        }
    });

    OperationLogHandle { cmd_tx, events_tx }
}

impl OperationLogHandle {
    /// Subscribes to runtime events.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.events_tx.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RuntimeError::ChannelClosed)?;
        rx.await.map_err(|_| RuntimeError::ChannelClosed)
    }

    /// Sequences, configures, serializes and queues `operation`.
    pub async fn submit(&self, operation: Operation) -> Result<SeqNo, RuntimeError> {
        self.request(|resp| Command::Submit { operation, resp }).await?
    }

    /// Maps a new, empty segment.
    pub async fn create_segment(&self, name: impl Into<String>) -> Result<SeqNo, RuntimeError> {
        let name = name.into();
        self.request(|resp| Command::CreateSegment { name, resp }).await?
    }

    /// Current metadata of segment `name`.
    pub async fn segment(&self, name: impl Into<String>) -> Result<Option<SegmentMetadata>, RuntimeError> {
        let name = name.into();
        self.request(|resp| Command::Segment { name, resp }).await
    }

    /// Waits until everything queued so far is durable.
    ///
    /// Fails with [`PersistError::Stalled`] while records from a failed
    /// append are still held back; each call retries them.
    pub async fn flush(&self) -> Result<SeqNo, RuntimeError> {
        self.request(|resp| Command::Flush { resp }).await?
    }

    /// Writes a metadata checkpoint now.
    pub async fn checkpoint(&self) -> Result<SeqNo, RuntimeError> {
        self.request(|resp| Command::Checkpoint { resp }).await?
    }

    /// Flushes and stops the runtime. If held-back records cannot be
    /// written the runtime keeps running and the error is returned.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.request(|resp| Command::Shutdown { resp }).await?
    }
}

struct Writer {
    log: OperationLog,
    events_tx: broadcast::Sender<LogEvent>,
    persist_tx: Option<mpsc::Sender<PersistMsg>>,
    config: RuntimeConfig,
    ops_since_checkpoint: usize,
}

impl Writer {
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Submit { operation, resp } => {
                let op_type = operation.operation_type();
                let record = self.log.submit(operation);
                let res = self.commit(op_type, record).await;
                if res.is_ok() {
                    self.maybe_auto_checkpoint().await;
                }
                let _ = resp.send(res);
            }
            Command::CreateSegment { name, resp } => {
                let record = self.log.create_segment(name);
                let res = self.commit(OperationType::MapSegment, record).await;
                let _ = resp.send(res);
            }
            Command::Segment { name, resp } => {
                let _ = resp.send(self.log.metadata().get(&name).cloned());
            }
            Command::Flush { resp } => {
                let out = if let Some(tx) = &self.persist_tx {
                    let (flush_tx, flush_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Flush { resp: flush_tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        flush_rx
                            .await
                            .map_err(|_| RuntimeError::ChannelClosed)
                            .and_then(|r| r.map_err(RuntimeError::from))
                    }
                } else {
                    Ok(self.log.metadata().last_sequence_number())
                };
                let _ = resp.send(out);
            }
            Command::Checkpoint { resp } => {
                let _ = resp.send(self.checkpoint().await);
            }
            Command::Shutdown { resp } => {
                let out = if let Some(tx) = &self.persist_tx {
                    let (done_tx, done_rx) = oneshot::channel();
                    if tx.send(PersistMsg::Shutdown { resp: done_tx }).await.is_err() {
                        Err(RuntimeError::ChannelClosed)
                    } else {
                        done_rx
                            .await
                            .map_err(|_| RuntimeError::ChannelClosed)
                            .and_then(|r| r.map_err(RuntimeError::from))
                    }
                } else {
                    Ok(())
                };
                // Held-back records keep the runtime alive so a later flush or
                // shutdown can still write them.
                let stop = !matches!(out, Err(RuntimeError::Persist(_)));
                if let Err(err) = &out {
                    warn!(%err, "shutdown did not complete");
                }
                let _ = resp.send(out);
                return stop;
            }
        }

        false
    }

    async fn commit(
        &mut self,
        op_type: OperationType,
        record: Result<SerializedRecord, MetadataError>,
    ) -> Result<SeqNo, RuntimeError> {
        let record = record?;
        let seq = record.sequence_number;

        if let Some(tx) = &self.persist_tx {
            let urgent = self.config.flush_on_seal
                && matches!(op_type, OperationType::Seal | OperationType::Merge);
            tx.send(PersistMsg::Record { record, urgent })
                .await
                .map_err(|_| RuntimeError::ChannelClosed)?;
        } else {
            let _ = self.events_tx.send(LogEvent::DurableUpTo { seq });
        }

        let _ = self.events_tx.send(LogEvent::Committed { seq, op_type });
        self.ops_since_checkpoint += 1;
        Ok(seq)
    }

    async fn checkpoint(&mut self) -> Result<SeqNo, RuntimeError> {
        let record = self.log.checkpoint();
        let seq = self.commit(OperationType::MetadataCheckpoint, record).await?;
        self.ops_since_checkpoint = 0;

        if self.config.truncate_after_checkpoint {
            if let Some(tx) = &self.persist_tx {
                tx.send(PersistMsg::Truncate { before: seq })
                    .await
                    .map_err(|_| RuntimeError::ChannelClosed)?;
            }
        }

        info!(seq, segments = self.log.metadata().segment_count(), "metadata checkpoint written");
        let _ = self.events_tx.send(LogEvent::Checkpointed { seq });
        Ok(seq)
    }

    async fn maybe_auto_checkpoint(&mut self) {
        if self.config.checkpoint_every_ops == 0
            || self.ops_since_checkpoint < self.config.checkpoint_every_ops
        {
            return;
        }

        if let Err(err) = self.checkpoint().await {
            warn!(%err, "automatic checkpoint failed");
        }
    }
}

/// Persistence side of the runtime.
///
/// Records wait in `pending`, in sequence order, until the sink accepts
/// them. After a failed append the batch stays at the front of `pending`
/// and nothing newer reaches the sink until it has been written.
struct PersistWorker {
    sink: Arc<Mutex<Box<dyn LogSink>>>,
    pending: Vec<SerializedRecord>,
    last_durable: SeqNo,
    failure: Option<String>,
    durable_tx: mpsc::UnboundedSender<Result<SeqNo, PersistError>>,
    batch_max_ops: usize,
}

impl PersistWorker {
    fn stalled(&self, reason: String) -> PersistError {
        PersistError::Stalled {
            pending: self.pending.len(),
            last_durable: self.last_durable,
            reason,
        }
    }

    async fn with_sink<T, F>(&self, f: F) -> Result<T, PersistError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn LogSink) -> Result<T, PersistError> + Send + 'static,
    {
        let sink = Arc::clone(&self.sink);
        tokio::task::spawn_blocking(move || {
            let mut sink = sink.blocking_lock();
            f(&mut **sink)
        })
        .await
        .map_err(|e| PersistError::Message(format!("join error: {e}")))?
    }

    /// Appends everything pending, then optionally syncs the sink.
    /// Returns the highest durable sequence number.
    async fn persist(&mut self, sync: bool) -> Result<SeqNo, PersistError> {
        if !self.pending.is_empty() {
            let batch = Arc::new(std::mem::take(&mut self.pending));
            let shared = Arc::clone(&batch);
            match self.with_sink(move |sink| sink.append_records(&shared)).await {
                Ok(seq) => {
                    self.last_durable = self.last_durable.max(seq);
                    if self.failure.take().is_some() {
                        info!(count = batch.len(), seq, "held-back records written");
                    }
                    debug!(count = batch.len(), seq, "batch persisted");
                    let _ = self.durable_tx.send(Ok(self.last_durable));
                }
                Err(err) => {
                    let mut batch = Arc::try_unwrap(batch).unwrap_or_else(|b| b.as_ref().clone());
                    batch.append(&mut self.pending);
                    self.pending = batch;
                    let reason = err.to_string();
                    warn!(
                        pending = self.pending.len(),
                        last_durable = self.last_durable,
                        %err,
                        "append failed, holding records for retry"
                    );
                    self.failure = Some(reason.clone());
                    let _ = self.durable_tx.send(Err(self.stalled(reason.clone())));
                    return Err(self.stalled(reason));
                }
            }
        }

        if sync {
            self.with_sink(|sink| sink.flush()).await?;
        }
        Ok(self.last_durable)
    }

    async fn push(&mut self, record: SerializedRecord, urgent: bool) {
        self.pending.push(record);
        let full = self.pending.len() >= self.batch_max_ops;
        if self.failure.is_none() && (urgent || full) {
            if let Err(err) = self.persist(urgent).await {
                debug!(%err, "batch kept for retry");
            }
        }
    }

    async fn truncate_before(&mut self, before: SeqNo) {
        if let Err(err) = self.persist(true).await {
            warn!(before, %err, "skipping truncation while records are held back");
            return;
        }
        match self.with_sink(move |sink| sink.truncate_before(before)).await {
            Ok(removed) => info!(before, removed, "truncated log"),
            Err(err) => warn!(before, %err, "log truncation failed"),
        }
    }
}

fn spawn_persistence_worker(
    sink: Box<dyn LogSink>,
    mut rx: mpsc::Receiver<PersistMsg>,
    durable_tx: mpsc::UnboundedSender<Result<SeqNo, PersistError>>,
    config: RuntimeConfig,
) {
    let latency = Duration::from_millis(config.batch_max_latency_ms.max(1));
    let mut worker = PersistWorker {
        sink: Arc::new(Mutex::new(sink)),
        pending: Vec::new(),
        last_durable: NO_SEQUENCE_NUMBER,
        failure: None,
        durable_tx,
        batch_max_ops: config.batch_max_ops.max(1),
    };

    tokio::spawn(async move {
        let mut deadline = Instant::now() + latency;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else {
                        if let Err(err) = worker.persist(true).await {
                            error!(pending = worker.pending.len(), %err, "runtime dropped with records not durable");
                        }
                        break;
                    };

                    match msg {
                        PersistMsg::Record { record, urgent } => {
                            let was_empty = worker.pending.is_empty();
                            worker.push(record, urgent).await;
                            if was_empty || worker.pending.is_empty() {
                                deadline = Instant::now() + latency;
                            }
                        }
                        PersistMsg::Flush { resp } => {
                            let _ = resp.send(worker.persist(true).await);
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Truncate { before } => {
                            worker.truncate_before(before).await;
                            deadline = Instant::now() + latency;
                        }
                        PersistMsg::Shutdown { resp } => {
                            let result = worker.persist(true).await.map(drop);
                            let done = result.is_ok();
                            let _ = resp.send(result);
                            if done {
                                break;
                            }
                            deadline = Instant::now() + latency;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !worker.pending.is_empty() => {
                    if let Err(err) = worker.persist(false).await {
                        debug!(%err, "timed batch kept for retry");
                    }
                    deadline = Instant::now() + latency;
                }
            }
        }
    });
}
