//! Webhook notifications for execution transitions.
//!
//! Delivery is fire-and-forget: each POST runs on its own task, is retried
//! per the configured policy and only ever logged on failure.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio::runtime::Handle;

/// Maximum log lines carried by a payload.
pub const HOOK_LOG_LINES: usize = 100;

const HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Transition being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookEvent {
    /// Execution queued.
    Queue,
    /// Execution started.
    Start,
    /// Periodic progress.
    Progress,
    /// Execution finished.
    Finish,
}

/// JSON body posted to hook URLs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    /// Pipeline the event is about.
    pub pipeline_id: String,
    /// Transition.
    pub event: HookEvent,
    /// Outcome, on finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    /// Error log, on finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    /// Statistics, on finish.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Map<String, Value>>,
    /// Tail of the progress log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<Vec<String>>,
}

impl HookPayload {
    /// Creates a payload carrying only the id and event.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, event: HookEvent) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            event,
            success: None,
            errors: None,
            stats: None,
            log: None,
        }
    }

    /// Attaches the outcome.
    #[must_use]
    pub fn with_outcome(
        mut self,
        success: bool,
        errors: Vec<String>,
        stats: Map<String, Value>,
    ) -> Self {
        self.success = Some(success);
        self.errors = Some(errors);
        self.stats = Some(stats);
        self
    }

    /// Attaches the last [`HOOK_LOG_LINES`] lines of `log`.
    #[must_use]
    pub fn with_log(mut self, log: &str) -> Self {
        let lines: Vec<&str> = log.lines().collect();
        let start = lines.len().saturating_sub(HOOK_LOG_LINES);
        self.log = Some(lines[start..].iter().map(|l| (*l).to_string()).collect());
        self
    }
}

/// Posts hook payloads in the background.
#[derive(Debug, Clone)]
pub struct HookSender {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl HookSender {
    /// Creates a sender using `retry` for each delivery.
    #[must_use]
    pub fn new(retry: RetryPolicy) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client, retry }
    }

    /// Spawns one delivery per URL on the current runtime.
    ///
    /// Returns the number of deliveries spawned; zero when there are no URLs
    /// or no tokio runtime is running on this thread.
    pub fn send(&self, urls: &[String], payload: &HookPayload) -> usize {
        if urls.is_empty() {
            return 0;
        }
        let Ok(handle) = Handle::try_current() else {
            tracing::debug!(
                pipeline_id = %payload.pipeline_id,
                "No async runtime, skipping webhooks"
            );
            return 0;
        };

        for url in urls {
            let client = self.client.clone();
            let retry = self.retry.clone();
            let url = url.clone();
            let payload = payload.clone();
            handle.spawn(async move {
                let result = retry
                    .run(&url, || async {
                        client
                            .post(&url)
                            .json(&payload)
                            .send()
                            .await
                            .and_then(reqwest::Response::error_for_status)
                    })
                    .await;
                match result {
                    Ok(_) => tracing::debug!(
                        url = %url,
                        pipeline_id = %payload.pipeline_id,
                        event = ?payload.event,
                        "Webhook delivered"
                    ),
                    Err(e) => tracing::warn!(
                        url = %url,
                        pipeline_id = %payload.pipeline_id,
                        error = %e,
                        "Webhook delivery failed"
                    ),
                }
            });
        }
        urls.len()
    }
}

impl Default for HookSender {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

/// Hook URLs declared by pipeline details.
#[must_use]
pub fn hook_urls(pipeline_details: &Value) -> Vec<String> {
    pipeline_details
        .get("hooks")
        .and_then(Value::as_array)
        .map(|hooks| {
            hooks
                .iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{InMemoryBackend, PipelineState, PipelineStatus, StatusLimits, Trigger};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[test]
    fn test_queue_payload_omits_optional_fields() {
        let payload = HookPayload::new("./p", HookEvent::Queue);
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"pipeline_id": "./p", "event": "queue"})
        );
    }

    #[test]
    fn test_finish_payload() {
        let mut stats = Map::new();
        stats.insert("rows".to_string(), json!(3));
        let payload = HookPayload::new("./p", HookEvent::Finish).with_outcome(
            false,
            vec!["filter".to_string(), "ERROR boom".to_string()],
            stats,
        );
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "pipeline_id": "./p",
                "event": "finish",
                "success": false,
                "errors": ["filter", "ERROR boom"],
                "stats": {"rows": 3}
            })
        );
    }

    #[test]
    fn test_log_is_truncated_to_tail() {
        let log: Vec<String> = (0..150).map(|i| format!("line {i}")).collect();
        let payload = HookPayload::new("./p", HookEvent::Progress).with_log(&log.join("\n"));
        let lines = payload.log.unwrap();
        assert_eq!(lines.len(), HOOK_LOG_LINES);
        assert_eq!(lines[0], "line 50");
        assert_eq!(lines[99], "line 149");
    }

    #[test]
    fn test_hook_urls() {
        let details = json!({"hooks": ["http://a/hook", 5, "http://b/hook"]});
        assert_eq!(hook_urls(&details), vec!["http://a/hook", "http://b/hook"]);
        assert!(hook_urls(&json!({})).is_empty());
    }

    #[test]
    fn test_send_without_runtime_is_noop() {
        let sender = HookSender::default();
        let sent = sender.send(
            &["http://127.0.0.1:9/hook".to_string()],
            &HookPayload::new("./p", HookEvent::Start),
        );
        assert_eq!(sent, 0);
    }

    /// Answers each request with the next of `statuses` (200 once they run
    /// out) and forwards every request body.
    async fn hook_server(statuses: Vec<u16>) -> (String, mpsc::UnboundedReceiver<Value>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", listener.local_addr().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut statuses = statuses.into_iter();
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = read_body(&mut socket).await;
                tx.send(serde_json::from_slice(&body).unwrap()).unwrap();
                let status = statuses.next().unwrap_or(200);
                let response =
                    format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                socket.write_all(response.as_bytes()).await.unwrap();
            }
        });
        (url, rx)
    }

    async fn read_body(socket: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
            let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
                continue;
            };
            let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
            let length: usize = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .map_or(0, |v| v.trim().parse().unwrap());
            while buf.len() < end + 4 + length {
                let n = socket.read(&mut chunk).await.unwrap();
                assert!(n > 0, "connection closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
            return buf[end + 4..end + 4 + length].to_vec();
        }
    }

    async fn next_body(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("hook not delivered")
            .unwrap()
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Value>) {
        let extra = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(extra.is_err(), "unexpected delivery: {extra:?}");
    }

    fn hooked_status(url: &str, retry: RetryPolicy) -> PipelineStatus {
        let mut status = PipelineStatus::load(
            "./p",
            Arc::new(InMemoryBackend::new()),
            HookSender::new(retry),
            StatusLimits::default(),
        )
        .unwrap();
        status.init(json!({"pipeline": [], "hooks": [url]}), Value::Null, vec![], "h1");
        status.save().unwrap();
        status
    }

    #[tokio::test]
    async fn test_lifecycle_posts_each_transition() {
        let (url, mut rx) = hook_server(vec![]).await;
        let mut status = hooked_status(&url, RetryPolicy::no_retry());
        let mut stats = Map::new();
        stats.insert("rows".to_string(), json!(3));

        assert!(status.queue_execution("e1", Trigger::Manual).unwrap());
        assert!(status.start_execution("e1").unwrap());
        assert!(status
            .update_execution("e1", &["load: 3 rows".to_string()], false)
            .unwrap());
        assert!(status.finish_execution("e1", true, stats, vec![]).unwrap());

        let mut bodies = Vec::new();
        for _ in 0..3 {
            bodies.push(next_body(&mut rx).await);
        }
        assert_quiet(&mut rx).await;
        let event = |name: &str| {
            bodies
                .iter()
                .find(|b| b["event"] == name)
                .cloned()
                .unwrap_or_else(|| panic!("no {name} event in {bodies:?}"))
        };

        assert_eq!(event("queue"), json!({"pipeline_id": "./p", "event": "queue"}));
        assert_eq!(event("start"), json!({"pipeline_id": "./p", "event": "start"}));
        assert_eq!(
            event("finish"),
            json!({
                "pipeline_id": "./p",
                "event": "finish",
                "success": true,
                "errors": [],
                "stats": {"rows": 3},
                "log": ["load: 3 rows"]
            })
        );
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried() {
        let (url, mut rx) = hook_server(vec![500]).await;
        let sender = HookSender::new(
            RetryPolicy::default()
                .with_base_delay_ms(1)
                .with_max_attempts(3),
        );

        sender.send(&[url], &HookPayload::new("./p", HookEvent::Start));

        let first = next_body(&mut rx).await;
        let second = next_body(&mut rx).await;
        assert_eq!(first, second);
        assert_eq!(first["event"], "start");
        assert_quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unreachable_hook_does_not_change_the_outcome() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/hook", closed.local_addr().unwrap());
        drop(closed);
        let mut status = hooked_status(&url, RetryPolicy::no_retry());

        assert!(status.queue_execution("e1", Trigger::Manual).unwrap());
        assert!(status.start_execution("e1").unwrap());
        assert!(status
            .finish_execution("e1", true, Map::new(), vec![])
            .unwrap());
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(status.state().unwrap(), PipelineState::Succeeded);
        let last = status.last_execution().unwrap().unwrap();
        assert_eq!(last.success, Some(true));
        assert!(last.error_log.is_empty());
    }

    #[tokio::test]
    async fn test_send_spawns_per_url() {
        let sender = HookSender::new(RetryPolicy::no_retry());
        let sent = sender.send(
            &[
                "http://127.0.0.1:9/a".to_string(),
                "http://127.0.0.1:9/b".to_string(),
            ],
            &HookPayload::new("./p", HookEvent::Start),
        );
        assert_eq!(sent, 2);
    }
}
