//! Browser session management
//!
//! Launches one Chrome/Chromium instance on a persistent user-data dir (so
//! logged-in cookies survive between runs) and provisions one page per reward
//! target: navigate, wait for the claim element, activate it for the click
//! loop. Provisioning failures are retried with a fixed backoff and never
//! abort the other targets.

use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::BrowserError;
use crate::cancel::CancelToken;
use crate::results::now_stamp;
use crate::retry::{RetryFailure, RetryPolicy};

/// Navigation must settle within this bound per attempt.
const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
/// The claim element must appear within this bound per attempt.
const SELECTOR_TIMEOUT: Duration = Duration::from_secs(15);
const SELECTOR_POLL: Duration = Duration::from_millis(250);

/// XPaths on the reward page, besides the configurable claim selector.
mod selectors {
    pub const SECTION_TITLE: &str = r#"//*[@id="app"]/div/div[3]/section[1]/p[1]"#;
    pub const AWARD_INFO: &str = r#"//*[@id="app"]/div/div[3]/section[1]/p[2]"#;
}

/// Configuration for the browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserLaunchConfig {
    /// Path to Chrome/Chromium executable
    pub chrome_path: Option<String>,
    /// Run in headless mode
    pub headless: bool,
    /// Persistent user data directory (cookies live here)
    pub user_data_dir: Option<String>,
    /// Window width
    pub window_width: u32,
    /// Window height
    pub window_height: u32,
}

impl Default for BrowserLaunchConfig {
    fn default() -> Self {
        Self {
            chrome_path: None,
            headless: false,
            user_data_dir: None,
            window_width: 480,
            window_height: 640,
        }
    }
}

/// Page text fields extracted after provisioning, uploaded to the collector.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PageInfo {
    pub task_id: String,
    pub device_name: String,
    pub section_title: String,
    pub award_info: String,
    pub extract_time: String,
}

/// One launched browser shared by all targets; each target owns its own page.
pub struct BrowserSession {
    browser: Arc<RwLock<Option<Browser>>>,
}

impl BrowserSession {
    /// Launch the browser with the given config.
    pub async fn launch(config: &BrowserLaunchConfig) -> Result<Self, BrowserError> {
        info!("Launching browser (headless: {})", config.headless);

        let mut builder = BrowserConfig::builder();

        if !config.headless {
            builder = builder.with_head();
        }
        if let Some(ref path) = config.chrome_path {
            builder = builder.chrome_executable(path);
        }
        if let Some(ref dir) = config.user_data_dir {
            std::fs::create_dir_all(dir)?;
            builder = builder.user_data_dir(dir);
        }

        builder = builder
            .window_size(config.window_width, config.window_height)
            // Timer throttling in background tabs would starve the click loop
            .arg("--disable-background-timer-throttling")
            .arg("--no-sandbox");

        let browser_config = builder
            .build()
            .map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // Drain CDP events in the background; when the handler ends, Chrome
        // has disconnected or crashed.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser event error: {}", e);
                }
            }
            warn!("Chrome disconnected (event handler ended)");
        });

        info!("Browser session ready");
        Ok(Self {
            browser: Arc::new(RwLock::new(Some(browser))),
        })
    }

    /// Open and activate the reward page for one target.
    ///
    /// Waits `start_delay` before the first attempt so concurrent targets do
    /// not all navigate at once, then retries per `policy`. `None` means the
    /// target is excluded from the run; the caller continues with the rest.
    pub async fn provision_task_page(
        &self,
        task_id: &str,
        base_url: &str,
        selector: &str,
        policy: RetryPolicy,
        start_delay: Duration,
        cancel: &CancelToken,
    ) -> Option<Page> {
        if !cancel.sleep(start_delay).await {
            return None;
        }

        let target_url = match build_task_url(base_url, task_id) {
            Ok(url) => url,
            Err(e) => {
                warn!("Task {} has an unusable base URL {:?}: {}", task_id, base_url, e);
                return None;
            }
        };

        let outcome = policy
            .run(cancel, |attempt| {
                debug!(
                    "Task {} provisioning attempt {}/{}",
                    task_id, attempt, policy.attempts
                );
                self.try_provision(&target_url, selector, cancel)
            })
            .await;

        match outcome {
            Ok(page) => {
                info!("Task {} page ready: {}", task_id, target_url);
                Some(page)
            }
            Err(RetryFailure::Exhausted(e)) => {
                warn!(
                    "Task {} excluded: provisioning failed after {} attempts: {}",
                    task_id, policy.attempts, e
                );
                None
            }
            Err(RetryFailure::Cancelled) => {
                info!("Task {} provisioning cancelled", task_id);
                None
            }
        }
    }

    /// One provisioning attempt. The page is closed on failure so retries
    /// never leak pages.
    async fn try_provision(
        &self,
        url: &str,
        selector: &str,
        cancel: &CancelToken,
    ) -> Result<Page, BrowserError> {
        let page = self.open_page().await?;
        match prepare_page(&page, url, selector, cancel).await {
            Ok(()) => Ok(page),
            Err(e) => {
                let _ = page.clone().close().await;
                Err(e)
            }
        }
    }

    async fn open_page(&self) -> Result<Page, BrowserError> {
        let guard = self.browser.read().await;
        let browser = guard
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("browser already closed".into()))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::LaunchFailed(e.to_string()))
    }

    /// Close the browser. Safe to call once per run; pages die with it.
    pub async fn close(&self) {
        let mut guard = self.browser.write().await;
        if let Some(mut browser) = guard.take() {
            let _ = browser.close().await;
            let _ = browser.wait().await;
        }
        info!("Browser session closed");
    }
}

/// Navigate and activate the claim element on an already-open page.
async fn prepare_page(
    page: &Page,
    url: &str,
    selector: &str,
    cancel: &CancelToken,
) -> Result<(), BrowserError> {
    page.goto(url)
        .await
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

    tokio::time::timeout(NAVIGATION_TIMEOUT, page.wait_for_navigation())
        .await
        .map_err(|_| BrowserError::Timeout("navigation did not settle".into()))?
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

    wait_for_xpath(page, selector, SELECTOR_TIMEOUT, cancel).await?;

    let result: serde_json::Value = page
        .evaluate(activation_script(selector))
        .await
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
        .into_value()
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

    let activated = result
        .get("success")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if activated {
        Ok(())
    } else {
        let message = result
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("activation failed");
        Err(BrowserError::ElementNotFound(message.to_string()))
    }
}

/// Poll until the XPath matches a node, the bound elapses, or cancellation.
async fn wait_for_xpath(
    page: &Page,
    selector: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(), BrowserError> {
    let deadline = std::time::Instant::now() + timeout;
    let probe = format!(
        "document.evaluate({}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue !== null",
        js_string(selector)
    );

    loop {
        let found: bool = page
            .evaluate(probe.clone())
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
            .into_value()
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        if found {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            return Err(BrowserError::Timeout(format!(
                "selector {:?} did not appear within {:?}",
                selector, timeout
            )));
        }
        if !cancel.sleep(SELECTOR_POLL).await {
            return Err(BrowserError::Cancelled);
        }
    }
}

/// Cheap liveness check before a click window opens: a dead page fails the
/// whole target instead of burning the window on doomed clicks.
pub async fn probe_page(page: &Page) -> Result<(), BrowserError> {
    page.evaluate("true")
        .await
        .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;
    Ok(())
}

/// Click the claim element once. The caller applies the per-click timeout.
pub async fn click_target(page: &Page, selector: &str) -> Result<(), BrowserError> {
    let script = format!(
        r#"(function() {{
            const el = document.evaluate({sel}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
            if (!el) return false;
            el.click();
            return true;
        }})()"#,
        sel = js_string(selector)
    );

    let clicked: bool = page
        .evaluate(script)
        .await
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?
        .into_value()
        .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

    if clicked {
        Ok(())
    } else {
        Err(BrowserError::ElementNotFound(selector.to_string()))
    }
}

/// Read the two reward-page text fields. Best-effort: any failure yields None.
pub async fn extract_page_info(page: &Page, task_id: &str, device_name: &str) -> Option<PageInfo> {
    let script = format!(
        r#"(function() {{
            const grab = (xp) => {{
                const node = document.evaluate(xp, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
                return node && node.textContent ? node.textContent.trim() : '';
            }};
            return {{
                sectionTitle: grab({title}),
                awardInfo: grab({award})
            }};
        }})()"#,
        title = js_string(selectors::SECTION_TITLE),
        award = js_string(selectors::AWARD_INFO),
    );

    let value: serde_json::Value = match page.evaluate(script).await {
        Ok(result) => match result.into_value() {
            Ok(value) => value,
            Err(e) => {
                debug!("Task {} page info not deserializable: {}", task_id, e);
                return None;
            }
        },
        Err(e) => {
            debug!("Task {} page info extraction failed: {}", task_id, e);
            return None;
        }
    };

    let field = |key: &str| {
        value
            .get(key)
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    Some(PageInfo {
        task_id: task_id.to_string(),
        device_name: device_name.to_string(),
        section_title: field("sectionTitle"),
        award_info: field("awardInfo"),
        extract_time: now_stamp(),
    })
}

/// Append `task_id` to the reward base URL's query string.
fn build_task_url(base_url: &str, task_id: &str) -> Result<String, url::ParseError> {
    let mut url = url::Url::parse(base_url)?;
    url.query_pairs_mut().append_pair("task_id", task_id);
    Ok(url.to_string())
}

/// JSON-encode a string for safe embedding in an evaluated script.
fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

/// DOM mutation that enables and relabels the claim element so the click
/// loop can act on it even while the page still marks it disabled.
fn activation_script(selector: &str) -> String {
    format!(
        r#"(function() {{
            const btn = document.evaluate({sel}, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null).singleNodeValue;
            if (!btn) return {{ success: false, message: 'claim button not found' }};
            btn.removeAttribute('disabled');
            btn.classList.remove('disabled', 'disable');
            btn.classList.add('active');
            btn.style.pointerEvents = 'auto';
            btn.style.opacity = '1';
            btn.textContent = 'Claim now';
            return {{ success: true, message: 'claim button activated' }};
        }})()"#,
        sel = js_string(selector)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_url_appends_the_task_id() {
        let url = build_task_url("https://example.com/award-exchange.html", "abc123").unwrap();
        assert_eq!(url, "https://example.com/award-exchange.html?task_id=abc123");
    }

    #[test]
    fn task_url_rejects_garbage() {
        assert!(build_task_url("not a url", "t").is_err());
    }

    #[test]
    fn js_string_escapes_embedded_quotes() {
        let xpath = r#"//*[@id="app"]/div"#;
        let encoded = js_string(xpath);
        assert!(encoded.starts_with('"') && encoded.ends_with('"'));
        assert!(encoded.contains(r#"\"app\""#));
        // the selector survives inside the activation script
        assert!(activation_script(xpath).contains(&encoded));
    }
}
