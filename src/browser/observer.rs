//! Reward-submission response observer
//!
//! Watches a provisioned page's network traffic for the reward-claim POST and
//! derives the target's true outcome from the response body, independent of
//! the click loop's own accounting. The captured record overwrites any
//! fallback entry and is also appended to the local audit log.

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventRequestWillBeSent, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use tracing::{debug, info};

use super::BrowserError;
use crate::audit::{AuditEntry, AuditLog};
use crate::results::{OutcomeRecord, ResultCache};

/// Path of the reward-submission call on the remote site.
pub const REWARD_SUBMIT_PATH: &str = "/x/activity_components/mission/receive";

/// Correlation rule for the one request that reveals the outcome.
///
/// Deliberately a loose substring match on the URL; kept in one place so the
/// rule can be tightened to exact path + query parsing without touching the
/// listener control flow.
pub fn matches_reward_submission(url: &str, method: &str) -> bool {
    url.contains(REWARD_SUBMIT_PATH) && method.eq_ignore_ascii_case("POST")
}

/// Register the network listener for one target's page.
///
/// Fires asynchronously for the rest of the page's life; the spawned task
/// ends when the page closes and its event streams run dry.
pub async fn attach(
    page: &Page,
    task_id: &str,
    cache: Arc<ResultCache>,
    audit: Arc<AuditLog>,
    device_name: String,
) -> Result<(), BrowserError> {
    page.execute(EnableParams::default())
        .await
        .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

    let mut requests = page
        .event_listener::<EventRequestWillBeSent>()
        .await
        .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;
    let mut responses = page
        .event_listener::<EventResponseReceived>()
        .await
        .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?;

    let page = page.clone();
    let task_id = task_id.to_string();

    tokio::spawn(async move {
        // Request ids of in-flight reward submissions on this page.
        let mut pending: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                request = requests.next() => match request {
                    Some(event) => {
                        if matches_reward_submission(&event.request.url, &event.request.method) {
                            pending.insert(event.request_id.inner().clone());
                        }
                    }
                    None => break,
                },
                response = responses.next() => match response {
                    Some(event) => {
                        if pending.remove(event.request_id.inner()) {
                            record_response(&page, &event, &task_id, &cache, &audit, &device_name)
                                .await;
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("Response observer for task {} detached", task_id);
    });

    Ok(())
}

/// Fetch and parse a matched response body, then write the authoritative
/// record. Every failure here is swallowed: a malformed response must not
/// crash the page event loop, and the fallback path still covers the target.
async fn record_response(
    page: &Page,
    event: &EventResponseReceived,
    task_id: &str,
    cache: &ResultCache,
    audit: &AuditLog,
    device_name: &str,
) {
    let body = match page
        .execute(GetResponseBodyParams::new(event.request_id.clone()))
        .await
    {
        Ok(response) => response.result.clone(),
        Err(e) => {
            debug!("Task {} reward response body unavailable: {}", task_id, e);
            return;
        }
    };

    let raw = if body.base64_encoded {
        match base64::engine::general_purpose::STANDARD
            .decode(&body.body)
            .map(String::from_utf8)
        {
            Ok(Ok(text)) => text,
            _ => {
                debug!("Task {} reward response body is not valid base64 text", task_id);
                return;
            }
        }
    } else {
        body.body
    };

    let payload: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            debug!("Task {} reward response is not JSON: {}", task_id, e);
            return;
        }
    };

    let code = payload.get("code").and_then(serde_json::Value::as_i64);
    let message = payload
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    let record = OutcomeRecord::observed(task_id, code, message, device_name);
    info!(
        "Task {} reward response captured: code={:?} status={:?}",
        task_id, code, record.status
    );

    cache.insert_observed(record);
    audit
        .append(&AuditEntry::new(
            task_id,
            device_name,
            &event.response.url,
            event.response.status,
            payload,
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_requires_path_and_post() {
        let url = "https://api.example.com/x/activity_components/mission/receive?csrf=a";
        assert!(matches_reward_submission(url, "POST"));
        assert!(matches_reward_submission(url, "post"));
        assert!(!matches_reward_submission(url, "GET"));
        assert!(!matches_reward_submission(
            "https://api.example.com/x/other/endpoint",
            "POST"
        ));
    }
}
