// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fire-and-forget outbound publish to the cloud relay, and the long-lived
//! inbound echo stream that mirrors cross-machine traffic back in. Both run
//! as independent background tasks that only ever talk to the Broker Core
//! through an event channel — no shared mutable state crosses the boundary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::config::CloudTokenSource;

const PUBLISH_BASE_BACKOFF: Duration = Duration::from_millis(500);
const PUBLISH_MAX_BACKOFF: Duration = Duration::from_secs(30);
const PUBLISH_MAX_ATTEMPTS: u32 = 10;
const PUBLISH_JITTER: f64 = 0.2;

const ECHO_RECONNECT_BASE: Duration = Duration::from_secs(1);
const ECHO_RECONNECT_CAP: Duration = Duration::from_secs(30);
const CATCHUP_LIMIT: usize = 500;

/// A message queued for publish to the cloud relay.
#[derive(Debug, Clone)]
pub struct OutboundPublishJob {
    pub message_id: String,
    pub channel: String,
    pub body: Value,
    attempts: u32,
    next_attempt_at: Instant,
}

impl OutboundPublishJob {
    pub fn new(message_id: impl Into<String>, channel: impl Into<String>, body: Value) -> Self {
        Self { message_id: message_id.into(), channel: channel.into(), body, attempts: 0, next_attempt_at: Instant::now() }
    }
}

/// An echo of a message received from the cloud relay, carrying enough to
/// both feed the Dedup Cache and enter the local delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EchoEvent {
    pub event_id: String,
    pub channel: String,
    pub from: String,
    pub text: String,
    pub ts: i64,
}

/// Events the Cloud Mirror hands back to the Broker Core.
#[derive(Debug, Clone)]
pub enum CloudEvent {
    PublishOk { message_id: String },
    /// Terminal publish failure after exhausting the retry budget; the
    /// Broker Core dead-letters this to persistence and notifies the
    /// originating client.
    PublishAbandoned { message_id: String, channel: String, reason: String },
    EchoReceived(EchoEvent),
}

pub struct CloudMirrorConfig {
    pub endpoint: Option<String>,
    pub token: Option<String>,
    pub token_source: CloudTokenSource,
}

/// Handle the Broker Core holds to enqueue outbound publishes. Cheap to
/// clone; every clone shares the same background publisher task.
#[derive(Clone)]
pub struct CloudMirrorHandle {
    publish_tx: mpsc::Sender<OutboundPublishJob>,
    backlog: Arc<AtomicUsize>,
}

impl CloudMirrorHandle {
    /// Enqueue `job` for publish. Returns `false` if the publisher task has
    /// already shut down (cloud mirroring disabled or broker shutting down).
    pub async fn publish(&self, job: OutboundPublishJob) -> bool {
        let accepted = self.publish_tx.send(job).await.is_ok();
        if accepted {
            self.backlog.fetch_add(1, Ordering::Relaxed);
        }
        accepted
    }

    /// Outstanding publish jobs not yet resolved to `publish_ok` or
    /// `publish_failed`/abandoned, for `get_metrics`.
    pub fn backlog(&self) -> usize {
        self.backlog.load(Ordering::Relaxed)
    }

    /// Record that one job reached a terminal outcome (success or
    /// abandonment). Called by the core as it observes `CloudEvent`s.
    pub fn mark_resolved(&self) {
        self.backlog.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Start the publisher and echo-stream tasks. If `config.endpoint` is unset,
/// cloud mirroring is disabled: publish jobs are accepted and silently
/// dropped, and no echo stream is started.
pub fn spawn(config: CloudMirrorConfig, events_tx: mpsc::Sender<CloudEvent>) -> CloudMirrorHandle {
    let (publish_tx, publish_rx) = mpsc::channel::<OutboundPublishJob>(256);
    let backlog = Arc::new(AtomicUsize::new(0));

    match config.endpoint {
        Some(endpoint) => {
            tokio::spawn(run_publisher(endpoint.clone(), config.token.clone(), publish_rx, events_tx.clone()));
            tokio::spawn(run_echo_stream(endpoint, config.token, config.token_source, events_tx));
        }
        None => {
            tokio::spawn(async move {
                let mut publish_rx = publish_rx;
                while publish_rx.recv().await.is_some() {
                    // Cloud mirroring disabled; local delivery is unaffected.
                }
            });
        }
    }

    CloudMirrorHandle { publish_tx, backlog }
}

async fn run_publisher(
    endpoint: String,
    token: Option<String>,
    mut jobs_rx: mpsc::Receiver<OutboundPublishJob>,
    events_tx: mpsc::Sender<CloudEvent>,
) {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default();
    let mut pending: Vec<OutboundPublishJob> = Vec::new();

    loop {
        let next_deadline = pending.iter().map(|j| j.next_attempt_at).min();
        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    job = jobs_rx.recv() => {
                        match job {
                            Some(job) => pending.push(job),
                            None => break,
                        }
                    }
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => match jobs_rx.recv().await {
                Some(job) => pending.push(job),
                None => break,
            },
        }

        let now = Instant::now();
        let mut still_pending = Vec::new();
        for mut job in pending.drain(..) {
            if job.next_attempt_at > now {
                still_pending.push(job);
                continue;
            }
            match publish_once(&client, &endpoint, token.as_deref(), &job).await {
                Ok(()) => {
                    let _ = events_tx.send(CloudEvent::PublishOk { message_id: job.message_id }).await;
                }
                Err(reason) => {
                    job.attempts += 1;
                    if job.attempts >= PUBLISH_MAX_ATTEMPTS {
                        warn!(message_id = %job.message_id, attempts = job.attempts, %reason, "cloud publish abandoned");
                        let _ =
                            events_tx.send(CloudEvent::PublishAbandoned { message_id: job.message_id, channel: job.channel, reason }).await;
                    } else {
                        debug!(message_id = %job.message_id, attempt = job.attempts, %reason, "cloud publish retrying");
                        job.next_attempt_at = Instant::now() + publish_backoff(job.attempts);
                        still_pending.push(job);
                    }
                }
            }
        }
        pending = still_pending;
    }
}

fn publish_backoff(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let base_ms = PUBLISH_BASE_BACKOFF.as_millis() as u64;
    let cap_ms = PUBLISH_MAX_BACKOFF.as_millis() as u64;
    let exp_ms = base_ms.saturating_mul(1u64 << exponent).min(cap_ms);
    let jitter = rand::rng().random_range(-PUBLISH_JITTER..=PUBLISH_JITTER);
    let jittered_ms = (exp_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}

async fn publish_once(client: &reqwest::Client, endpoint: &str, token: Option<&str>, job: &OutboundPublishJob) -> Result<(), String> {
    let url = format!("{endpoint}/publish");
    let mut req = client.post(url).json(&serde_json::json!({
        "channel": job.channel,
        "text": job.body,
        "event_id": job.message_id,
    }));
    if let Some(token) = token {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await.map_err(|e| e.to_string())?;
    if resp.status().is_success() {
        Ok(())
    } else {
        Err(format!("cloud publish responded with status {}", resp.status()))
    }
}

async fn run_echo_stream(endpoint: String, token: Option<String>, token_source: CloudTokenSource, events_tx: mpsc::Sender<CloudEvent>) {
    let client = reqwest::Client::builder().timeout(Duration::from_secs(10)).build().unwrap_or_default();
    let mut backoff = ECHO_RECONNECT_BASE;
    let mut cursors: HashMap<String, String> = HashMap::new();

    loop {
        match connect_echo_stream(&endpoint, token.as_deref(), token_source).await {
            Ok(mut stream) => {
                debug!(%endpoint, "cloud echo stream connected");
                backoff = ECHO_RECONNECT_BASE;
                catch_up(&client, &endpoint, token.as_deref(), &cursors, &events_tx).await;

                loop {
                    match stream.next().await {
                        Some(Ok(Message::Text(text))) => {
                            if let Ok(echo) = serde_json::from_str::<EchoEvent>(&text) {
                                cursors.insert(echo.channel.clone(), echo.event_id.clone());
                                let _ = events_tx.send(CloudEvent::EchoReceived(echo)).await;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(err = %e, "cloud echo stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            Err(e) => {
                debug!(err = %e, "cloud echo stream connect failed");
            }
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(ECHO_RECONNECT_CAP);
    }
}

async fn connect_echo_stream(
    endpoint: &str,
    token: Option<&str>,
    token_source: CloudTokenSource,
) -> anyhow::Result<tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>> {
    let ws_url = to_ws_url(endpoint);
    let mut request = ws_url.into_client_request()?;
    if token_source == CloudTokenSource::Subprotocol {
        if let Some(token) = token {
            request.headers_mut().insert("Sec-WebSocket-Protocol", HeaderValue::from_str(token)?);
        }
    }

    let (mut stream, _response) = tokio_tungstenite::connect_async(request).await?;

    if token_source == CloudTokenSource::FirstFrame {
        if let Some(token) = token {
            let frame = serde_json::json!({"type": "auth", "token": token}).to_string();
            stream.send(Message::Text(frame.into())).await?;
        }
    }

    Ok(stream)
}

fn to_ws_url(endpoint: &str) -> String {
    let ws_base = if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_owned()
    };
    format!("{ws_base}/echo")
}

async fn catch_up(client: &reqwest::Client, endpoint: &str, token: Option<&str>, cursors: &HashMap<String, String>, events_tx: &mpsc::Sender<CloudEvent>) {
    for (channel, cursor) in cursors {
        let url = format!("{endpoint}/channels/{channel}/after/{cursor}");
        let mut req = client.get(url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        let Ok(resp) = req.send().await else { continue };
        let Ok(events) = resp.json::<Vec<EchoEvent>>().await else { continue };
        for echo in events.into_iter().take(CATCHUP_LIMIT) {
            let _ = events_tx.send(CloudEvent::EchoReceived(echo)).await;
        }
    }
}

#[cfg(test)]
#[path = "cloud_tests.rs"]
mod tests;
