//! Task runner
//!
//! Drives one run end to end: provision a page per selected target (staggered,
//! concurrent), attach the response observer, then run every target's
//! wait-then-click phase machine concurrently. After the join barrier the
//! result cache is finalized and the batch is uploaded. Browser resources are
//! closed exactly once, even when the run fails.

use std::future::Future;
use std::time::Duration;

use chromiumoxide::Page;
use chrono::{DateTime, Local};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::{self, observer, BrowserError, BrowserLaunchConfig, BrowserSession};
use crate::cancel::CancelToken;
use crate::registry::TargetConfig;
use crate::results::{self, OutcomeRecord, OutcomeStatus, UploadBatch};
use crate::retry::RetryPolicy;
use crate::server::UploadError;
use crate::RunContext;

/// Per-click timeout inside the clicking window.
const CLICK_TIMEOUT: Duration = Duration::from_millis(50);
/// Poll granularity while waiting for a target's start time.
const START_POLL: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum RunError {
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("no task page could be provisioned, nothing to run")]
    NoPages,
}

/// Everything a run needs beyond the registry: page target, policies, browser.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub base_url: String,
    pub claim_selector: String,
    pub provision_policy: RetryPolicy,
    pub provision_stagger: Duration,
    pub upload_policy: RetryPolicy,
    pub browser: BrowserLaunchConfig,
}

/// Aggregated, user-visible result of one run.
#[derive(Debug)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub not_executed: usize,
    pub upload_ok: bool,
    pub upload_detail: String,
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} targets: {} succeeded, {} failed, {} not executed; {}",
            self.total, self.succeeded, self.failed, self.not_executed, self.upload_detail
        )
    }
}

/// Execution phases of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TargetPhase {
    Idle,
    WaitingForStart,
    Clicking,
    Done,
}

/// What one target's task produced at the join barrier.
enum TargetOutcome {
    /// The clicking window ran to completion (or was cut short by cancel).
    Completed(ClickSummary),
    /// Cancelled before the first click.
    CancelledBeforeStart,
    /// The task itself failed; individual click failures do not end up here.
    Failed(BrowserError),
}

/// Click-loop accounting for one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClickSummary {
    pub attempted: u32,
    pub succeeded: u32,
    pub elapsed_ms: u64,
}

impl ClickSummary {
    pub fn failed(&self) -> u32 {
        self.attempted - self.succeeded
    }

    pub fn message(&self, requested: Duration) -> String {
        format!(
            "click window of {:.1}s finished: {} attempts, {} succeeded",
            requested.as_secs_f64(),
            self.attempted,
            self.succeeded
        )
    }
}

/// Run all selected targets and upload the aggregated outcome.
///
/// The cleanup path (browser close, cancel-token reset) runs regardless of
/// how the inner run ends, so an aborted run never leaks Chrome or poisons
/// the next run's cancellation state.
pub async fn run_targets(ctx: &RunContext, settings: &RunSettings) -> Result<RunSummary, RunError> {
    let session = match BrowserSession::launch(&settings.browser).await {
        Ok(session) => session,
        Err(e) => {
            ctx.cancel.reset();
            return Err(e.into());
        }
    };
    let outcome = execute_run(ctx, settings, &session).await;
    session.close().await;
    ctx.cancel.reset();
    outcome
}

async fn execute_run(
    ctx: &RunContext,
    settings: &RunSettings,
    session: &BrowserSession,
) -> Result<RunSummary, RunError> {
    let selected: Vec<String> = ctx.registry.selected().to_vec();
    info!("Starting run for {} selected targets", selected.len());

    // Provision all pages concurrently, each delayed by its stagger slot.
    let provision_futures = selected.iter().enumerate().map(|(index, task_id)| {
        let delay = settings.provision_stagger * index as u32;
        async move {
            let page = session
                .provision_task_page(
                    task_id,
                    &settings.base_url,
                    &settings.claim_selector,
                    settings.provision_policy,
                    delay,
                    &ctx.cancel,
                )
                .await;
            (task_id.clone(), page)
        }
    });

    let mut pages: Vec<(String, Page)> = Vec::new();
    for (task_id, page) in join_all(provision_futures).await {
        let Some(page) = page else { continue };

        if let Err(e) = observer::attach(
            &page,
            &task_id,
            ctx.cache.clone(),
            ctx.audit.clone(),
            ctx.device_name.clone(),
        )
        .await
        {
            warn!("Task {} response observer not attached: {}", task_id, e);
        }

        if let Some(info) = browser::extract_page_info(&page, &task_id, &ctx.device_name).await {
            if let Err(e) = ctx.collector.upload_page_info(&info).await {
                debug!("Task {} page info upload failed: {}", task_id, e);
            }
        }

        pages.push((task_id, page));
    }

    if pages.is_empty() {
        return Err(RunError::NoPages);
    }
    info!("{}/{} targets provisioned", pages.len(), selected.len());

    // Run every provisioned target's phase machine concurrently.
    let target_futures = pages.iter().filter_map(|(task_id, page)| {
        ctx.registry.get(task_id).map(|config| {
            let task_id = task_id.clone();
            async move {
                let outcome = run_single_target(
                    page,
                    &task_id,
                    &settings.claim_selector,
                    config,
                    &ctx.cancel,
                )
                .await;
                (task_id, config.duration, outcome)
            }
        })
    });

    for (task_id, requested, outcome) in join_all(target_futures).await {
        let record = match outcome {
            TargetOutcome::Completed(summary) => {
                info!("Task {}: {}", task_id, summary.message(requested));
                OutcomeRecord::fallback(
                    &task_id,
                    OutcomeStatus::Success,
                    summary.message(requested),
                    &ctx.device_name,
                )
            }
            TargetOutcome::CancelledBeforeStart => {
                info!("Task {} cancelled before its start time", task_id);
                OutcomeRecord::fallback(
                    &task_id,
                    OutcomeStatus::NotExecuted,
                    "cancelled before start time".into(),
                    &ctx.device_name,
                )
            }
            TargetOutcome::Failed(e) => {
                warn!("Task {} execution failed: {}", task_id, e);
                OutcomeRecord::fallback(
                    &task_id,
                    OutcomeStatus::Failure,
                    format!("execution error: {}", e),
                    &ctx.device_name,
                )
            }
        };
        // Observer records win; this only fills vacant slots.
        ctx.cache.insert_fallback(record);
    }

    results::finalize(&ctx.cache, &selected, &ctx.device_name);

    let batch = UploadBatch::from_cache(&ctx.cache, &ctx.device_name);
    let (upload_ok, upload_detail) = match ctx
        .collector
        .upload_results(&batch, settings.upload_policy, &ctx.cancel)
        .await
    {
        Ok(ack) => {
            // Secondary, best-effort: ship the audit log alongside the batch.
            if ctx.audit.exists() {
                match ctx.collector.upload_log_file(&ctx.audit).await {
                    Ok(detail) => info!("Audit log uploaded: {}", detail),
                    Err(e) => warn!("Audit log upload failed: {}", e),
                }
            }
            (true, format!("uploaded {} results ({})", batch.total_tasks, ack))
        }
        Err(e) => {
            let detail = match &e {
                UploadError::Exhausted {
                    backup: Some(path), ..
                } => format!("{}; backup written to {}", e, path.display()),
                _ => e.to_string(),
            };
            warn!("Result upload failed: {}", detail);
            (false, detail)
        }
    };

    Ok(summarize(ctx, upload_ok, upload_detail))
}

fn summarize(ctx: &RunContext, upload_ok: bool, upload_detail: String) -> RunSummary {
    let records = ctx.cache.snapshot();
    let count = |status: OutcomeStatus| records.iter().filter(|r| r.status == status).count();
    RunSummary {
        total: records.len(),
        succeeded: count(OutcomeStatus::Success),
        failed: count(OutcomeStatus::Failure),
        not_executed: count(OutcomeStatus::NotExecuted),
        upload_ok,
        upload_detail,
    }
}

/// One target's phase machine: Idle -> WaitingForStart -> Clicking -> Done.
async fn run_single_target(
    page: &Page,
    task_id: &str,
    selector: &str,
    config: &TargetConfig,
    cancel: &CancelToken,
) -> TargetOutcome {
    let mut phase = TargetPhase::Idle;
    debug!("Task {} {:?}", task_id, phase);

    phase = TargetPhase::WaitingForStart;
    debug!("Task {} {:?} until {}", task_id, phase, config.start_at);
    if !wait_until(config.start_at, cancel).await {
        debug!("Task {} {:?} (cancelled)", task_id, TargetPhase::Done);
        return TargetOutcome::CancelledBeforeStart;
    }

    if let Err(e) = browser::probe_page(page).await {
        return TargetOutcome::Failed(e);
    }

    phase = TargetPhase::Clicking;
    debug!(
        "Task {} {:?} for {:?} (interval {:?})",
        task_id, phase, config.duration, config.interval
    );
    let summary = click_phase(
        || browser::click_target(page, selector),
        config.interval,
        config.duration,
        cancel,
    )
    .await;

    phase = TargetPhase::Done;
    debug!("Task {} {:?}", task_id, phase);
    TargetOutcome::Completed(summary)
}

/// Wait until `start_at`, polling at fine granularity and checking the cancel
/// token every iteration. Returns false if cancelled before the time arrives.
pub async fn wait_until(start_at: DateTime<Local>, cancel: &CancelToken) -> bool {
    while Local::now() < start_at {
        if cancel.is_cancelled() {
            return false;
        }
        if !cancel.sleep(START_POLL).await {
            return false;
        }
    }
    !cancel.is_cancelled()
}

/// Bounded-duration click loop.
///
/// Runs until `duration` elapses on the monotonic clock or the token fires.
/// Each attempt gets [`CLICK_TIMEOUT`]; failures and timeouts are counted but
/// never abort the loop. Sleeps `interval` between attempts when nonzero.
pub async fn click_phase<F, Fut>(
    mut click: F,
    interval: Duration,
    duration: Duration,
    cancel: &CancelToken,
) -> ClickSummary
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BrowserError>>,
{
    let started = std::time::Instant::now();
    let mut attempted: u32 = 0;
    let mut succeeded: u32 = 0;

    while started.elapsed() < duration && !cancel.is_cancelled() {
        match tokio::time::timeout(CLICK_TIMEOUT, click()).await {
            Ok(Ok(())) => succeeded += 1,
            Ok(Err(_)) | Err(_) => {}
        }
        attempted += 1;

        if !interval.is_zero() && !cancel.sleep(interval).await {
            break;
        }
    }

    ClickSummary {
        attempted,
        succeeded,
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn waiting_never_ends_before_the_start_time() {
        let cancel = CancelToken::new();
        let start_at = Local::now() + chrono::Duration::milliseconds(300);

        assert!(wait_until(start_at, &cancel).await);
        assert!(Local::now() >= start_at);
    }

    #[tokio::test]
    async fn waiting_stops_promptly_on_cancel() {
        let cancel = CancelToken::new();
        let start_at = Local::now() + chrono::Duration::seconds(60);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let begun = std::time::Instant::now();
        assert!(!wait_until(start_at, &cancel).await);
        assert!(begun.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn click_phase_attempts_about_three_clicks_in_the_scenario() {
        // interval 0.5s, duration 1.5s -> attempts at ~0, 0.5, 1.0
        let cancel = CancelToken::new();
        let summary = click_phase(
            || async { Ok(()) },
            Duration::from_millis(500),
            Duration::from_millis(1500),
            &cancel,
        )
        .await;

        assert!(
            (3..=4).contains(&summary.attempted),
            "attempted {} clicks",
            summary.attempted
        );
        assert_eq!(summary.attempted, summary.succeeded + summary.failed());
        // elapsed is at least the window minus one iteration of slack
        assert!(summary.elapsed_ms >= 1000);
    }

    #[tokio::test]
    async fn click_failures_are_counted_but_not_fatal() {
        let calls = AtomicU32::new(0);
        let cancel = CancelToken::new();

        let summary = click_phase(
            || {
                let n = calls.fetch_add(1, Ordering::Relaxed);
                async move {
                    if n % 2 == 0 {
                        Err(BrowserError::ElementNotFound("btn".into()))
                    } else {
                        Ok(())
                    }
                }
            },
            Duration::from_millis(20),
            Duration::from_millis(200),
            &cancel,
        )
        .await;

        assert!(summary.attempted >= 2);
        assert!(summary.failed() >= 1);
        assert_eq!(summary.attempted, summary.succeeded + summary.failed());
    }

    #[tokio::test]
    async fn zero_interval_loops_without_sleeping_until_the_window_closes() {
        let cancel = CancelToken::new();
        let summary = click_phase(
            || async { Ok(()) },
            Duration::ZERO,
            Duration::from_millis(50),
            &cancel,
        )
        .await;

        assert!(summary.attempted >= 1);
        assert!(summary.elapsed_ms >= 50);
    }

    #[tokio::test]
    async fn cancel_cuts_the_click_window_short() {
        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            canceller.cancel();
        });

        let summary = click_phase(
            || async { Ok(()) },
            Duration::from_millis(20),
            Duration::from_secs(30),
            &cancel,
        )
        .await;

        assert!(summary.elapsed_ms < 5_000);
        assert!(summary.attempted >= 1);
    }

    #[test]
    fn summary_message_reports_both_counts() {
        let summary = ClickSummary {
            attempted: 7,
            succeeded: 5,
            elapsed_ms: 1500,
        };
        let message = summary.message(Duration::from_secs_f64(1.5));
        assert!(message.contains("7 attempts"));
        assert!(message.contains("5 succeeded"));
        assert!(message.contains("1.5s"));
    }
}
