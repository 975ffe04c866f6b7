//! Reward Clicker - CLI entry point
//!
//! Usage: `reward-clicker [START_TIME [INTERVAL_SECS [DURATION_SECS]]]`
//!
//! `START_TIME` accepts `HH:MM:SS` (rolls to tomorrow if already past) or
//! `+N` / bare seconds relative to now, and is applied to every configured
//! target. Without arguments each target keeps its persisted schedule.

use anyhow::Context;
use tracing::{info, warn};

use reward_clicker::registry::{
    TaskRegistry, DEFAULT_CLICK_DURATION, DEFAULT_CLICK_INTERVAL,
};
use reward_clicker::server::ServerConfig;
use reward_clicker::{device_name, init_logging, log_dir, runner, AppConfig, RunContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_logging();

    info!("Starting Reward Clicker (device: {})", device_name());
    if let Some(dir) = log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let config = AppConfig::load();

    let registry = match AppConfig::registry_path() {
        Some(path) if path.exists() => match TaskRegistry::load(&path) {
            Ok(registry) => {
                info!("Loaded {} persisted targets", registry.len());
                registry
            }
            Err(e) => {
                warn!("Failed to load task registry: {}", e);
                TaskRegistry::new()
            }
        },
        _ => TaskRegistry::new(),
    };

    let mut ctx = RunContext::new(&config, registry).context("failed to set up run context")?;

    // Collector config is best-effort: an unreachable collector still lets a
    // locally configured run go ahead.
    let remote = match ctx.collector.fetch_config().await {
        Ok(remote) => {
            for task_id in remote.reward_task_ids.values() {
                if ctx.registry.add_task(task_id) {
                    info!("Added collector-provided target {}", task_id);
                }
            }
            remote
        }
        Err(e) => {
            warn!("Collector config fetch failed, using local config: {}", e);
            ServerConfig::default()
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Some(start_time) = args.first() {
        let interval: f64 = match args.get(1) {
            Some(raw) => raw.parse().context("invalid interval")?,
            None => DEFAULT_CLICK_INTERVAL,
        };
        let duration: f64 = match args.get(2) {
            Some(raw) => raw.parse().context("invalid duration")?,
            None => DEFAULT_CLICK_DURATION,
        };
        for task_id in ctx.registry.selected().to_vec() {
            ctx.registry
                .update_task(&task_id, start_time, interval, duration)
                .with_context(|| format!("invalid schedule for target {}", task_id))?;
        }
        info!(
            "Applied schedule {} / {}s interval / {}s window to {} targets",
            start_time,
            interval,
            duration,
            ctx.registry.len()
        );
    }

    if ctx.registry.is_empty() {
        anyhow::bail!(
            "no targets configured; the collector returned none and none are persisted locally"
        );
    }

    let settings = config.run_settings(&remote);

    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, stopping after in-flight work");
            cancel.cancel();
        }
    });

    let summary = runner::run_targets(&ctx, &settings).await?;
    info!("Run finished: {}", summary);

    if let Some(path) = AppConfig::registry_path() {
        if let Err(e) = ctx.registry.save(&path) {
            warn!("Failed to persist task registry: {}", e);
        }
    }
    config.save();

    Ok(())
}
