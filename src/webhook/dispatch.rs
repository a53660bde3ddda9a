use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::debug;

use super::format::TargetKind;

/// Result of one send attempt. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// The endpoint answered but refused the payload.
    Rejected(String),
    /// No usable answer: connection error, timeout, unreadable response.
    TransportFailed(String),
}

/// Where formatted payloads go.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn deliver(&self, payload: &Value) -> DispatchOutcome;
}

/// Posts payloads as JSON to a single webhook URL.
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
    kind: TargetKind,
}

impl WebhookSink {
    pub fn new(url: &str, kind: TargetKind, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            client,
            url: url.to_string(),
            kind,
        })
    }
}

/// DingTalk, WeCom and Feishu answer HTTP 200 even when they drop a message;
/// the real verdict is an `errcode`/`code` field in the body.
fn api_error(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let (key, code) = ["errcode", "code", "StatusCode"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_i64).map(|code| (*key, code)))?;
    if code == 0 {
        return None;
    }
    let message = ["errmsg", "msg", "StatusMessage"]
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_str))
        .unwrap_or("");
    Some(format!("{}={} {}", key, code, message).trim_end().to_string())
}

#[async_trait]
impl Sink for WebhookSink {
    async fn deliver(&self, payload: &Value) -> DispatchOutcome {
        let response = match self.client.post(&self.url).json(payload).send().await {
            Ok(response) => response,
            Err(e) => return DispatchOutcome::TransportFailed(e.to_string()),
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                return DispatchOutcome::TransportFailed(format!(
                    "failed to read response body ({}): {}",
                    status, e
                ))
            }
        };

        if !status.is_success() {
            return DispatchOutcome::Rejected(format!("{}: {}", status, body));
        }
        if self.kind != TargetKind::Generic {
            if let Some(reason) = api_error(&body) {
                return DispatchOutcome::Rejected(format!("{}: {}", status, reason));
            }
        }
        DispatchOutcome::Delivered
    }
}

/// Enforces a minimum spacing between the starts of consecutive sends.
pub struct RateLimiter {
    interval: Duration,
    last_send: Option<Instant>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_send: None,
        }
    }

    /// Wait until the next send is allowed, then claim the slot.
    pub async fn acquire(&mut self) {
        if let Some(last) = self.last_send {
            let ready_at = last + self.interval;
            if ready_at > Instant::now() {
                debug!("Waiting {:?} before next webhook call", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_send = Some(Instant::now());
    }
}

/// A sink behind a rate limiter. Every call counts against the limit,
/// whatever its outcome; nothing is retried here.
pub struct Dispatcher {
    sink: Box<dyn Sink>,
    limiter: RateLimiter,
}

impl Dispatcher {
    pub fn new(sink: Box<dyn Sink>, interval: Duration) -> Self {
        Self {
            sink,
            limiter: RateLimiter::new(interval),
        }
    }

    pub fn interval(&self) -> Duration {
        self.limiter.interval
    }

    pub async fn send(&mut self, payload: &Value) -> DispatchOutcome {
        self.limiter.acquire().await;
        self.sink.deliver(payload).await
    }
}
