//! Append-only audit trail for the fedguard decision service.
//!
//! Every decision and policy mutation is recorded as an [`AuditEvent`].
//! Appends go into a bounded in-memory buffer and never block on I/O; a
//! background [`AuditFlusher`] drains the buffer into the readable history
//! and, optionally, a [JSON Lines](https://jsonlines.org/) file. Overflow
//! drops the oldest unflushed events and is itself recorded as a
//! `PERFORMANCE_WARNING` event.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use audit_log::{AuditFlusher, AuditKind, AuditLog, AuditWriter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let log = Arc::new(AuditLog::default());
//! let writer = AuditWriter::new("/var/log/fedguard/audit.jsonl").await?;
//! let flusher = AuditFlusher::spawn(Arc::clone(&log), Some(writer), Duration::from_secs(1));
//!
//! log.append(AuditKind::EngineStart, serde_json::json!({"version": "0.1.0"}));
//!
//! flusher.shutdown().await;
//! let page = log.page(None, 50);
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod flusher;
pub mod log;
pub mod writer;

pub use entry::{AuditEvent, AuditKind};
pub use flusher::{AuditFlusher, DEFAULT_FLUSH_INTERVAL};
pub use log::{AuditLog, AuditPage, DEFAULT_BUFFER_CAPACITY, DEFAULT_RETENTION};
pub use writer::{AuditWriteError, AuditWriter};
