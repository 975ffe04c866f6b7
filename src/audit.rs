//! Append-only audit log of captured reward responses.
//!
//! One JSON object per line, written independently of upload success so the
//! true remote outcome survives even when the collector is unreachable.
//! Appends from concurrent targets are serialized behind one writer lock.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::results::now_stamp;

pub const AUDIT_LOG_FILE: &str = "api_responses.log";

/// One captured-response line.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub task_id: String,
    pub device_name: String,
    pub url: String,
    pub http_status: i64,
    pub response: serde_json::Value,
}

impl AuditEntry {
    pub fn new(
        task_id: &str,
        device_name: &str,
        url: &str,
        http_status: i64,
        response: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: now_stamp(),
            task_id: task_id.to_string(),
            device_name: device_name.to_string(),
            url: url.to_string(),
            http_status,
            response,
        }
    }
}

/// JSONL audit log with serialized appends.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<()>,
}

impl AuditLog {
    /// Create the log under `dir`, ensuring the directory exists.
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(AUDIT_LOG_FILE),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Append one entry. Failures are logged, never raised: a bad disk must
    /// not take down the page event loop that captured the response.
    pub async fn append(&self, entry: &AuditEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize audit entry for {}: {}", entry.task_id, e);
                return;
            }
        };

        let _guard = self.writer.lock().await;
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            error!("Failed to append audit entry to {:?}: {}", self.path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("reward-clicker-audit-{}-{}", tag, std::process::id()))
    }

    #[tokio::test]
    async fn concurrent_appends_produce_whole_lines() {
        let dir = temp_dir("concurrent");
        let _ = std::fs::remove_dir_all(&dir);
        let log = std::sync::Arc::new(AuditLog::new(&dir).unwrap());

        let mut handles = Vec::new();
        for i in 0..8 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let entry = AuditEntry::new(
                    &format!("task-{}", i),
                    "dev",
                    "https://example.com/x/activity_components/mission/receive",
                    200,
                    serde_json::json!({ "code": 0, "message": "ok" }),
                );
                log.append(&entry).await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 8);
        for line in lines {
            let entry: AuditEntry = serde_json::from_str(line).unwrap();
            assert_eq!(entry.response["code"], 0);
        }

        let _ = std::fs::remove_dir_all(&dir);
    }
}
