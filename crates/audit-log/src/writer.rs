use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::entry::AuditEvent;

/// Errors raised while mirroring audit events to disk.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create audit directory for {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open audit log {path}: {source}")]
    OpenFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize audit event: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write audit log {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Append-only JSON-lines mirror of the flushed audit history.
///
/// One newline-terminated JSON object per [`AuditEvent`]. The file is only
/// ever appended to.
pub struct AuditWriter {
    file: tokio::fs::File,
    path: PathBuf,
    lines_written: u64,
}

impl AuditWriter {
    /// Open (or create) `path` in append mode, creating parent directories.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditWriteError::CreateDir {
                    path: path.clone(),
                    source,
                })?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| AuditWriteError::OpenFile {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            file,
            path,
            lines_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Events written since this writer was opened.
    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Append a single event. Not flushed until [`flush`](Self::flush).
    pub async fn write(&mut self, event: &AuditEvent) -> Result<(), AuditWriteError> {
        self.append(std::slice::from_ref(event)).await
    }

    /// Append every event in `batch` with one write, then flush.
    pub async fn write_batch(&mut self, batch: &[AuditEvent]) -> Result<(), AuditWriteError> {
        self.append(batch).await?;
        self.flush().await
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(|source| AuditWriteError::Write {
            path: self.path.clone(),
            source,
        })
    }

    async fn append(&mut self, events: &[AuditEvent]) -> Result<(), AuditWriteError> {
        let mut buf = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }
        self.file
            .write_all(&buf)
            .await
            .map_err(|source| AuditWriteError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.lines_written += events.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::AuditKind;

    #[tokio::test]
    async fn writes_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");

        let mut writer = AuditWriter::new(&path).await.unwrap();
        writer
            .write(&AuditEvent::new(1, AuditKind::EngineStart, serde_json::json!({})))
            .await
            .unwrap();
        writer
            .write(&AuditEvent::new(
                2,
                AuditKind::PolicyViolation,
                serde_json::json!({"reason": "no matching policy"}),
            ))
            .await
            .unwrap();
        writer.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.seq, 2);
        assert_eq!(second.kind, AuditKind::PolicyViolation);
    }

    #[tokio::test]
    async fn batch_write_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let mut writer = AuditWriter::new(&path).await.unwrap();

        let batch: Vec<AuditEvent> = (1..=3)
            .map(|seq| AuditEvent::new(seq, AuditKind::Custom, serde_json::json!({})))
            .collect();
        writer.write_batch(&batch).await.unwrap();
        assert_eq!(writer.lines_written(), 3);
        assert_eq!(writer.path(), path.as_path());

        let seqs: Vec<u64> = std::fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<AuditEvent>(l).unwrap().seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn reopening_appends_instead_of_truncating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        for seq in 1..=2 {
            let mut writer = AuditWriter::new(&path).await.unwrap();
            writer
                .write(&AuditEvent::new(seq, AuditKind::Custom, serde_json::json!({})))
                .await
                .unwrap();
            writer.flush().await.unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
