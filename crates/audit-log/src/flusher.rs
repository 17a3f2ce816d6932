use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::log::AuditLog;
use crate::writer::AuditWriter;

/// Default period between background flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the background task that drains an [`AuditLog`].
///
/// The task flushes every `interval`, or sooner when the pending buffer
/// passes half its capacity. Each flushed batch is optionally mirrored to a
/// JSON-lines file through an [`AuditWriter`]. Dropping the handle also
/// stops the task after one last flush; [`shutdown`](Self::shutdown) waits
/// for that flush to complete.
pub struct AuditFlusher {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl AuditFlusher {
    /// Spawn the background flush task on the current Tokio runtime.
    pub fn spawn(log: Arc<AuditLog>, writer: Option<AuditWriter>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_flush_loop(log, writer, interval, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Signal the task to perform a final flush and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(err) = self.handle.await {
            tracing::error!(%err, "audit flusher task failed");
        }
    }
}

/// Core loop executed inside the background task.
async fn run_flush_loop(
    log: Arc<AuditLog>,
    mut writer: Option<AuditWriter>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = log.wait_for_pressure() => false,
            _ = shutdown_rx.changed() => true,
        };

        flush_once(&log, writer.as_mut()).await;

        if stopping {
            tracing::debug!("audit flusher shutting down");
            return;
        }
    }
}

async fn flush_once(log: &AuditLog, writer: Option<&mut AuditWriter>) {
    let batch = log.flush();
    if batch.is_empty() {
        return;
    }
    let Some(writer) = writer else {
        return;
    };
    if let Err(err) = writer.write_batch(&batch).await {
        // The in-memory history already holds the batch; only the file
        // mirror is missing these lines.
        tracing::error!(%err, count = batch.len(), "failed to persist audit batch");
    }
}
