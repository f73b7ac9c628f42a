use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::filter::LogFilter;
use crate::record::AuditRecord;
use crate::writer::{AuditWriteError, AuditWriter};

/// Most records drained from the channel into one file write.
const MAX_BATCH: usize = 64;

/// Per-subscriber backlog before a slow live reader starts losing records.
const SUBSCRIBER_BUFFER: usize = 256;

/// Why a record could not be handed to the alert stream.
///
/// Never fatal to enforcement: the verdict that produced the record stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EmitFailure {
    #[error("alert stream backlog is full; record dropped")]
    Backlogged,
    #[error("alert stream is closed; record dropped")]
    Closed,
}

/// Counters describing what happened to records offered to a sink.
#[derive(Debug, Default)]
pub struct SinkStats {
    queued: AtomicU64,
    dropped: AtomicU64,
    lost: AtomicU64,
}

impl SinkStats {
    /// Records accepted onto the channel.
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Records refused at submission.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queued records the writer failed to persist.
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }
}

/// Cloneable, non-blocking handle for submitting [`AuditRecord`]s.
///
/// `try_log` never waits: if the bounded channel is full or the background
/// writer has gone away the record is counted as dropped and an
/// [`EmitFailure`] is returned.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditRecord>,
    live: broadcast::Sender<AuditRecord>,
    stats: Arc<SinkStats>,
}

impl AuditSink {
    /// Open the log at `path` and spawn the background writer task.
    ///
    /// The task appends records as JSON lines in batches, republishes every
    /// written record to live subscribers and exits once the last sink clone
    /// is dropped and the channel is drained.
    pub async fn start(
        path: impl AsRef<Path>,
        buffer: usize,
    ) -> Result<(Self, JoinHandle<()>), AuditWriteError> {
        let mut writer = AuditWriter::open(path).await?;
        let (sink, rx) = Self::detached(buffer);
        let live = sink.live.clone();
        let stats = Arc::clone(&sink.stats);

        let handle = tokio::spawn(async move {
            run_writer_loop(&mut writer, rx, live, &stats).await;
        });

        Ok((sink, handle))
    }

    /// Create a sink whose records are drained by the caller instead of a
    /// file writer. Live subscriptions on a detached sink receive nothing.
    pub fn detached(buffer: usize) -> (Self, mpsc::Receiver<AuditRecord>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (live, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        let sink = Self {
            tx,
            live,
            stats: Arc::new(SinkStats::default()),
        };
        (sink, rx)
    }

    /// Queue a record without waiting.
    pub fn try_log(&self, record: AuditRecord) -> Result<(), EmitFailure> {
        match self.tx.try_send(record) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hsp_audit_records_queued_total").increment(1);
                Ok(())
            }
            Err(err) => {
                let failure = match err {
                    mpsc::error::TrySendError::Full(_) => EmitFailure::Backlogged,
                    mpsc::error::TrySendError::Closed(_) => EmitFailure::Closed,
                };
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hsp_audit_records_dropped_total").increment(1);
                Err(failure)
            }
        }
    }

    /// Follow records as they are written, restricted by `filter`.
    pub fn subscribe(&self, filter: LogFilter) -> Subscription {
        Subscription {
            rx: self.live.subscribe(),
            filter,
        }
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Shared counters that outlive the sink, for reporting after shutdown.
    pub fn stats_handle(&self) -> Arc<SinkStats> {
        Arc::clone(&self.stats)
    }
}

/// A live, filtered view of the alert stream.
pub struct Subscription {
    rx: broadcast::Receiver<AuditRecord>,
    filter: LogFilter,
}

impl Subscription {
    /// Wait for the next matching record. Returns `None` once the writer has
    /// shut down.
    pub async fn next(&mut self) -> Option<AuditRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) if self.filter.matches(&record) => return Some(record),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "alert subscriber lagged; records skipped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Drain the channel into the log file, batching whatever is already queued.
async fn run_writer_loop(
    writer: &mut AuditWriter,
    mut rx: mpsc::Receiver<AuditRecord>,
    live: broadcast::Sender<AuditRecord>,
    stats: &SinkStats,
) {
    let mut batch = Vec::with_capacity(MAX_BATCH);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match rx.try_recv() {
                Ok(record) => batch.push(record),
                Err(_) => break,
            }
        }

        match writer.write_batch(&batch).await {
            Ok(()) => {
                for record in batch.drain(..) {
                    // No subscribers is not an error.
                    let _ = live.send(record);
                }
            }
            Err(err) => {
                let lost = batch.len() as u64;
                stats.lost.fetch_add(lost, Ordering::Relaxed);
                metrics::counter!("hsp_audit_records_lost_total").increment(lost);
                tracing::error!(
                    %err,
                    lost,
                    lost_total = stats.lost(),
                    path = %writer.path().display(),
                    "failed to write audit records"
                );
                batch.clear();
            }
        }
    }

    tracing::debug!(
        lines = writer.lines_written(),
        lost = stats.lost(),
        "alert writer background task shutting down"
    );
}
