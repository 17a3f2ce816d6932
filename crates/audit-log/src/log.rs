use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::entry::{AuditEvent, AuditKind};

/// Default number of unflushed events held before the oldest are dropped.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4096;

/// Default number of flushed events kept readable.
pub const DEFAULT_RETENTION: usize = 100_000;

/// A newest-first slice of the flushed audit history.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub events: Vec<AuditEvent>,
    /// Cursor for the next (older) page, if any entries remain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_before: Option<u64>,
}

struct Inner {
    next_seq: u64,
    /// Appended but not yet flushed.
    pending: VecDeque<AuditEvent>,
    /// Flushed and readable, oldest first.
    history: VecDeque<AuditEvent>,
    dropped_since_flush: u64,
    dropped_total: u64,
}

/// Append-only, bounded, buffered audit log.
///
/// [`append`](Self::append) never blocks on I/O: events land in a bounded
/// pending buffer that a background [`AuditFlusher`](crate::AuditFlusher)
/// drains into the readable history (and optionally a JSON-lines file).
/// When the pending buffer is full the oldest unflushed events are dropped
/// and the next flush records a [`AuditKind::PerformanceWarning`] carrying
/// the drop count.
pub struct AuditLog {
    inner: Mutex<Inner>,
    buffer_capacity: usize,
    retention: usize,
    wake: Notify,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AuditLog")
            .field("buffer_capacity", &self.buffer_capacity)
            .field("retention", &self.retention)
            .field("pending", &inner.pending.len())
            .field("history", &inner.history.len())
            .field("dropped_total", &inner.dropped_total)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_CAPACITY, DEFAULT_RETENTION)
    }
}

impl AuditLog {
    /// Create a log holding at most `buffer_capacity` unflushed events and
    /// `retention` flushed ones. Both are clamped to at least 1.
    pub fn new(buffer_capacity: usize, retention: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_seq: 1,
                pending: VecDeque::new(),
                history: VecDeque::new(),
                dropped_since_flush: 0,
                dropped_total: 0,
            }),
            buffer_capacity: buffer_capacity.max(1),
            retention: retention.max(1),
            wake: Notify::new(),
        }
    }

    /// Append an event and return its sequence number.
    pub fn append(&self, kind: AuditKind, payload: serde_json::Value) -> u64 {
        let (seq, wake) = {
            let mut inner = self.inner.lock();
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.pending.push_back(AuditEvent::new(seq, kind, payload));

            while inner.pending.len() > self.buffer_capacity {
                inner.pending.pop_front();
                inner.dropped_since_flush += 1;
                inner.dropped_total += 1;
            }
            (seq, inner.pending.len() * 2 >= self.buffer_capacity)
        };

        if wake {
            self.wake.notify_one();
        }
        seq
    }

    /// Move every pending event into the readable history and return the
    /// flushed batch in append order.
    ///
    /// If events were dropped since the last flush, a
    /// `PERFORMANCE_WARNING` event is appended to the batch.
    pub fn flush(&self) -> Vec<AuditEvent> {
        let mut inner = self.inner.lock();
        let mut batch: Vec<AuditEvent> = inner.pending.drain(..).collect();

        if inner.dropped_since_flush > 0 {
            let dropped = inner.dropped_since_flush;
            inner.dropped_since_flush = 0;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            tracing::warn!(dropped, "audit buffer overflowed; oldest entries dropped");
            batch.push(AuditEvent::new(
                seq,
                AuditKind::PerformanceWarning,
                serde_json::json!({
                    "dropped": dropped,
                    "buffer_capacity": self.buffer_capacity,
                }),
            ));
        }

        inner.history.extend(batch.iter().cloned());
        while inner.history.len() > self.retention {
            inner.history.pop_front();
        }
        batch
    }

    /// Newest-first page of flushed events with `seq < before`.
    pub fn page(&self, before: Option<u64>, limit: usize) -> AuditPage {
        let inner = self.inner.lock();
        let limit = limit.max(1);

        let mut events: Vec<AuditEvent> = inner
            .history
            .iter()
            .rev()
            .filter(|e| before.map_or(true, |b| e.seq < b))
            .take(limit + 1)
            .cloned()
            .collect();

        let next_before = if events.len() > limit {
            events.truncate(limit);
            events.last().map(|e| e.seq)
        } else {
            None
        };

        AuditPage {
            events,
            next_before,
        }
    }

    /// Number of flushed, readable events.
    pub fn len(&self) -> usize {
        self.inner.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of events waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Total events dropped by buffer overflow since startup.
    pub fn dropped_total(&self) -> u64 {
        self.inner.lock().dropped_total
    }

    /// Resolves when an append crosses half of the buffer capacity.
    pub(crate) async fn wait_for_pressure(&self) {
        self.wake.notified().await;
    }
}
