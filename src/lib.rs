//! Reward Clicker
//!
//! Time-gated reward-claim automation: provisions one browser page per task,
//! watches the claim API over CDP, fires a click burst at each task's start
//! time and uploads the aggregated outcome to a collector service.

pub mod audit;
pub mod browser;
pub mod cancel;
pub mod registry;
pub mod results;
pub mod retry;
pub mod runner;
pub mod server;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use audit::AuditLog;
use browser::BrowserLaunchConfig;
use cancel::CancelToken;
use registry::TaskRegistry;
use results::ResultCache;
use retry::RetryPolicy;
use runner::RunSettings;
use server::{CollectorClient, ServerConfig, UploadError, UPLOAD_RETRY_COUNT};

/// Delay between consecutive page provisions (index * stagger).
pub const PROVISION_STAGGER: Duration = Duration::from_secs(2);

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Collector base URL
    pub server_url: String,

    /// Browser executable path (None = let the launcher find one)
    #[serde(default)]
    pub chrome_path: Option<String>,
    #[serde(default)]
    pub headless: bool,
    /// Persistent profile directory, keeps login cookies between runs
    #[serde(default)]
    pub cookies_dir: Option<String>,

    /// Reward page base URL (`?task_id=<id>` is appended per task)
    #[serde(default = "default_base_url")]
    pub reward_base_url: String,
    /// XPath of the claim element
    #[serde(default = "default_claim_selector")]
    pub reward_claim_selector: String,
    /// Provisioning attempts per task page
    #[serde(default = "default_max_reload_attempts")]
    pub max_reload_attempts: u32,
}

fn default_base_url() -> String {
    "https://www.bilibili.com/blackboard/era-award-exchange.html".to_string()
}

fn default_claim_selector() -> String {
    r#"//*[@id="app"]/div/div[3]/section[2]/div[1]"#.to_string()
}

fn default_max_reload_attempts() -> u32 {
    3
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server_url: "http://ocean.run.place".to_string(),
            chrome_path: None,
            headless: false,
            cookies_dir: None,
            reward_base_url: default_base_url(),
            reward_claim_selector: default_claim_selector(),
            max_reload_attempts: default_max_reload_attempts(),
        }
    }
}

/// App data directory (config, task registry, audit log, backups)
pub fn app_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("reward-clicker"))
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    app_dir().map(|p| p.join("logs"))
}

/// Device identity used in every record, batch and backup filename.
///
/// Computer name where available, pid-tagged fallback otherwise.
pub fn device_name() -> String {
    std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("device_{}", std::process::id()))
}

impl AppConfig {
    /// Get config file path
    fn config_path() -> Option<PathBuf> {
        app_dir().map(|p| p.join("config.json"))
    }

    /// Task registry persistence path
    pub fn registry_path() -> Option<PathBuf> {
        app_dir().map(|p| p.join("task_configs.json"))
    }

    /// Where exhausted upload batches are parked
    pub fn backup_dir() -> PathBuf {
        app_dir()
            .map(|p| p.join("upload_backups"))
            .unwrap_or_else(|| PathBuf::from("upload_backups"))
    }

    /// Load config from file
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }

    /// Merge collector-provided values over the local config and produce the
    /// settings one run needs. Collector silence leaves local values alone.
    pub fn run_settings(&self, remote: &ServerConfig) -> RunSettings {
        let base_url = remote
            .reward_base_url
            .clone()
            .unwrap_or_else(|| self.reward_base_url.clone());
        let claim_selector = remote
            .reward_claim_selector
            .clone()
            .unwrap_or_else(|| self.reward_claim_selector.clone());
        let max_attempts = remote.max_reload_attempts.unwrap_or(self.max_reload_attempts);
        let cookies_dir = remote
            .cookies_dir
            .clone()
            .or_else(|| self.cookies_dir.clone());

        RunSettings {
            base_url,
            claim_selector,
            provision_policy: RetryPolicy::for_provisioning(max_attempts),
            provision_stagger: PROVISION_STAGGER,
            upload_policy: RetryPolicy::for_upload(UPLOAD_RETRY_COUNT),
            browser: BrowserLaunchConfig {
                chrome_path: self.chrome_path.clone(),
                headless: self.headless,
                user_data_dir: cookies_dir,
                ..BrowserLaunchConfig::default()
            },
        }
    }
}

/// Everything a run reads or writes, threaded explicitly instead of globals.
pub struct RunContext {
    pub registry: TaskRegistry,
    pub cache: Arc<ResultCache>,
    pub audit: Arc<AuditLog>,
    pub collector: CollectorClient,
    pub device_name: String,
    pub cancel: CancelToken,
}

impl RunContext {
    pub fn new(config: &AppConfig, registry: TaskRegistry) -> Result<Self, UploadError> {
        let device = device_name();
        let audit_dir = app_dir().unwrap_or_else(|| PathBuf::from("."));
        Ok(Self {
            registry,
            cache: Arc::new(ResultCache::new()),
            audit: Arc::new(AuditLog::new(&audit_dir)?),
            collector: CollectorClient::new(
                &config.server_url,
                &device,
                AppConfig::backup_dir(),
            )?,
            device_name: device,
            cancel: CancelToken::new(),
        })
    }
}

/// Initialize logging (console + daily-rolling file)
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "reward-clicker.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_name_is_never_empty() {
        assert!(!device_name().is_empty());
    }

    #[test]
    fn remote_config_overrides_local_values() {
        let config = AppConfig::default();
        let remote = ServerConfig {
            reward_base_url: Some("https://example.com/claims".to_string()),
            max_reload_attempts: Some(5),
            ..ServerConfig::default()
        };

        let settings = config.run_settings(&remote);
        assert_eq!(settings.base_url, "https://example.com/claims");
        assert_eq!(settings.provision_policy.attempts, 5);
        // local value survives collector silence
        assert_eq!(settings.claim_selector, config.reward_claim_selector);
    }

    #[test]
    fn default_upload_policy_is_three_total_attempts() {
        let settings = AppConfig::default().run_settings(&ServerConfig::default());
        assert_eq!(settings.upload_policy.attempts, 3);
    }
}
