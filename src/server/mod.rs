//! Result-collector client
//!
//! Talks to the remote collector: config fetch, batch result upload with
//! bounded retries and a durable local backup on exhaustion, page-info upload,
//! and the best-effort audit-log upload.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::browser::PageInfo;
use crate::cancel::CancelToken;
use crate::results::{now_stamp, UploadBatch};
use crate::retry::{RetryFailure, RetryPolicy};

pub const CONFIG_SUFFIX: &str = "/get_config";
pub const UPLOAD_RESULT_SUFFIX: &str = "/upload_reward_result";
pub const UPLOAD_PAGE_INFO_SUFFIX: &str = "/upload_page_info";
pub const UPLOAD_LOG_SUFFIX: &str = "/upload_log_file";

/// Retries after the first upload attempt.
pub const UPLOAD_RETRY_COUNT: u32 = 2;

const CONFIG_TIMEOUT: Duration = Duration::from_secs(15);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const LOG_UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("collector request failed: {0}")]
    Transport(String),

    #[error("collector returned HTTP {0}")]
    HttpStatus(u16),

    #[error("collector rejected the request: {0}")]
    Rejected(String),

    #[error("upload failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: String,
        backup: Option<PathBuf>,
    },

    #[error("upload cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Collector-provided run configuration (`/get_config` content).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub reward_task_ids: HashMap<String, String>,
    #[serde(default)]
    pub cookies_dir: Option<String>,
    #[serde(default)]
    pub reward_base_url: Option<String>,
    #[serde(default)]
    pub reward_claim_selector: Option<String>,
    #[serde(default)]
    pub max_reload_attempts: Option<u32>,
}

#[derive(serde::Deserialize)]
struct ConfigEnvelope {
    status: String,
    #[serde(default)]
    content: ServerConfig,
    #[serde(default)]
    msg: Option<String>,
}

#[derive(serde::Deserialize)]
struct UploadAck {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    received_count: Option<u64>,
}

/// HTTP client for the remote collector.
pub struct CollectorClient {
    base_url: String,
    http: reqwest::Client,
    device_name: String,
    backup_dir: PathBuf,
}

impl CollectorClient {
    pub fn new(server_url: &str, device_name: &str, backup_dir: PathBuf) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        Ok(Self {
            base_url: server_url.trim_end_matches('/').to_string(),
            http,
            device_name: device_name.to_string(),
            backup_dir,
        })
    }

    fn endpoint(&self, suffix: &str) -> String {
        format!("{}{}", self.base_url, suffix)
    }

    /// Fetch the collector-managed run configuration.
    pub async fn fetch_config(&self) -> Result<ServerConfig, UploadError> {
        let response = self
            .http
            .get(self.endpoint(CONFIG_SUFFIX))
            .header("Device-ID", &self.device_name)
            .timeout(CONFIG_TIMEOUT)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::HttpStatus(response.status().as_u16()));
        }

        let envelope: ConfigEnvelope = response
            .json()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if envelope.status != "success" {
            return Err(UploadError::Rejected(
                envelope.msg.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        info!(
            "Fetched collector config: {} task ids",
            envelope.content.reward_task_ids.len()
        );
        Ok(envelope.content)
    }

    /// POST the batch with bounded retries.
    ///
    /// The first attempt runs even when the run was stopped: a cancelled
    /// run's aggregate (with its cancelled and not_executed records) still
    /// belongs at the collector. On exhaustion (or cancellation mid-retry)
    /// the full payload is written to a timestamped backup file first, so
    /// the data survives a dead collector, then the last error is returned.
    pub async fn upload_results(
        &self,
        batch: &UploadBatch,
        policy: RetryPolicy,
        cancel: &CancelToken,
    ) -> Result<String, UploadError> {
        let outcome = policy
            .run_at_least_once(cancel, |attempt| {
                info!(
                    "Uploading {} results (attempt {}/{})",
                    batch.total_tasks, attempt, policy.attempts
                );
                self.post_batch(batch)
            })
            .await;

        match outcome {
            Ok(detail) => Ok(detail),
            Err(failure) => {
                let last = match failure {
                    RetryFailure::Exhausted(e) => e.to_string(),
                    RetryFailure::Cancelled => UploadError::Cancelled.to_string(),
                };
                let backup = match self.save_local_backup(batch) {
                    Ok(path) => {
                        warn!("Upload backup written to {}", path.display());
                        Some(path)
                    }
                    Err(e) => {
                        warn!("Upload backup write failed: {}", e);
                        None
                    }
                };
                Err(UploadError::Exhausted {
                    attempts: policy.attempts,
                    last,
                    backup,
                })
            }
        }
    }

    async fn post_batch(&self, batch: &UploadBatch) -> Result<String, UploadError> {
        let response = self
            .http
            .post(self.endpoint(UPLOAD_RESULT_SUFFIX))
            .timeout(UPLOAD_TIMEOUT)
            .json(batch)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::HttpStatus(response.status().as_u16()));
        }

        let ack: UploadAck = response
            .json()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if ack.status != "success" {
            return Err(UploadError::Rejected(
                ack.message.unwrap_or_else(|| "unknown error".into()),
            ));
        }

        Ok(format!(
            "collector received {} records",
            ack.received_count.unwrap_or(batch.total_tasks as u64)
        ))
    }

    /// Upload one page's extracted info. Single attempt, caller decides how
    /// hard to care.
    pub async fn upload_page_info(&self, page_info: &PageInfo) -> Result<(), UploadError> {
        let response = self
            .http
            .post(self.endpoint(UPLOAD_PAGE_INFO_SUFFIX))
            .timeout(UPLOAD_TIMEOUT)
            .json(page_info)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Multipart upload of the local audit log.
    pub async fn upload_log_file(&self, audit: &AuditLog) -> Result<String, UploadError> {
        let bytes = tokio::fs::read(audit.path()).await?;
        let file_name = audit
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audit.log".to_string());

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("application/json")
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("log_file", part)
            .text("device_name", self.device_name.clone())
            .text("upload_time", now_stamp());

        let response = self
            .http
            .post(self.endpoint(UPLOAD_LOG_SUFFIX))
            .timeout(LOG_UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await
            .map_err(|e| UploadError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UploadError::HttpStatus(response.status().as_u16()));
        }
        Ok(file_name)
    }

    /// Persist the batch payload exactly as it would have been POSTed.
    fn save_local_backup(&self, batch: &UploadBatch) -> Result<PathBuf, UploadError> {
        std::fs::create_dir_all(&self.backup_dir)?;
        let path = self.backup_dir.join(format!(
            "backup_{}_{}.json",
            self.device_name,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ));
        let payload = serde_json::to_string_pretty(batch)
            .map_err(|e| UploadError::Transport(e.to_string()))?;
        std::fs::write(&path, payload)?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::{OutcomeRecord, ResultCache};

    fn temp_backup_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "reward-clicker-backup-{}-{}",
            tag,
            std::process::id()
        ))
    }

    fn sample_batch() -> UploadBatch {
        let cache = ResultCache::new();
        cache.insert_observed(OutcomeRecord::observed("t1", Some(0), Some("ok".into()), "dev"));
        cache.insert_observed(OutcomeRecord::observed("t2", Some(-1), None, "dev"));
        UploadBatch::from_cache(&cache, "dev")
    }

    #[test]
    fn endpoints_tolerate_trailing_slash() {
        let client =
            CollectorClient::new("http://collector:5000/", "dev", temp_backup_dir("ep")).unwrap();
        assert_eq!(
            client.endpoint(UPLOAD_RESULT_SUFFIX),
            "http://collector:5000/upload_reward_result"
        );
        assert_eq!(client.endpoint(CONFIG_SUFFIX), "http://collector:5000/get_config");
    }

    /// Minimal one-shot HTTP collector: accepts a single connection, reads
    /// the full request, answers with the given JSON body.
    async fn one_shot_collector(body: &'static str) -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 4096];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(split) = text.find("\r\n\r\n") {
                    let body_len = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if text.len() - split - 4 >= body_len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });

        addr
    }

    #[tokio::test]
    async fn stop_request_still_uploads_the_batch_once() {
        let addr = one_shot_collector(r#"{"status":"success","received_count":2}"#).await;

        let dir = temp_backup_dir("stopped");
        let _ = std::fs::remove_dir_all(&dir);
        let client =
            CollectorClient::new(&format!("http://{}", addr), "dev", dir.clone()).unwrap();

        let batch = sample_batch();
        let cancel = CancelToken::new();
        cancel.cancel();

        let detail = client
            .upload_results(&batch, RetryPolicy::new(3, Duration::from_millis(1)), &cancel)
            .await
            .unwrap();
        assert!(detail.contains("2 records"), "detail was {:?}", detail);
        // delivered, so no backup is parked locally
        assert!(!dir.exists() || std::fs::read_dir(&dir).unwrap().next().is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unreachable_collector_leaves_a_faithful_backup() {
        let dir = temp_backup_dir("durability");
        let _ = std::fs::remove_dir_all(&dir);
        // port 9 (discard) is never listening
        let client = CollectorClient::new("http://127.0.0.1:9", "dev", dir.clone()).unwrap();

        let batch = sample_batch();
        let policy = RetryPolicy::new(2, Duration::from_millis(1));
        let cancel = CancelToken::new();

        let err = client
            .upload_results(&batch, policy, &cancel)
            .await
            .unwrap_err();

        let UploadError::Exhausted {
            attempts,
            backup: Some(path),
            ..
        } = err
        else {
            panic!("expected exhaustion with a backup path");
        };
        assert_eq!(attempts, 2);

        let restored: UploadBatch =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored.total_tasks, batch.total_tasks);
        assert_eq!(restored.device_name, batch.device_name);
        assert_eq!(restored.results.len(), batch.results.len());
        assert_eq!(restored.results[0].task_id, "t1");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
