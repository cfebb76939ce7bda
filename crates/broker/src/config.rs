// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;

use clap::Parser;

/// Local agent message broker.
#[derive(Debug, Parser, Clone)]
#[command(name = "agent-broker", version, about)]
pub struct BrokerConfig {
    /// Directory holding broker.lock, state.json, pending.jsonl, and per-agent logs.
    #[arg(long, env = "BROKER_STATE_DIR", default_value = ".broker")]
    pub state_dir: PathBuf,

    /// Cloud relay base URL (e.g. https://relay.example.com). Cloud mirroring
    /// is disabled when unset.
    #[arg(long, env = "BROKER_CLOUD_ENDPOINT")]
    pub cloud_endpoint: Option<String>,

    /// Bearer token for cloud relay authentication.
    #[arg(long, env = "BROKER_CLOUD_TOKEN")]
    pub cloud_token: Option<String>,

    /// Where the cloud auth token is carried: as a WebSocket subprotocol, or
    /// as the first post-handshake control frame.
    #[arg(long, env = "BROKER_CLOUD_TOKEN_SOURCE", default_value = "subprotocol")]
    pub cloud_token_source: CloudTokenSource,

    /// Path to the reloadable output-scanner pattern file (JSON). Built-in
    /// defaults are used when unset.
    #[arg(long, env = "BROKER_ACTIVITY_PATTERNS_PATH")]
    pub activity_patterns_path: Option<PathBuf>,

    /// Soft cap on a single agent's pending-delivery queue before shedding.
    #[arg(long, env = "BROKER_MAX_QUEUE_DEPTH", default_value = "256")]
    pub max_queue_depth: usize,

    /// Echo-window duration in milliseconds.
    #[arg(long, env = "BROKER_ECHO_WINDOW_MS", default_value = "3000")]
    pub echo_window_ms: u64,

    /// Echo-window size in bytes (how far past the injection offset the
    /// scanner searches for the echo).
    #[arg(long, env = "BROKER_ECHO_WINDOW_BYTES", default_value = "32768")]
    pub echo_window_bytes: usize,

    /// Activity-window duration in milliseconds.
    #[arg(long, env = "BROKER_ACTIVITY_WINDOW_MS", default_value = "5000")]
    pub activity_window_ms: u64,

    /// Retry backoff ladder in milliseconds, applied on echo_timeout.
    #[arg(long, env = "BROKER_RETRY_BACKOFF_MS", value_delimiter = ',', default_value = "100,400,1600")]
    pub retry_backoff_ms: Vec<u64>,

    /// Dedup cache entry cap.
    #[arg(long, env = "BROKER_DEDUP_CAP", default_value = "65536")]
    pub dedup_cap: usize,

    /// Dedup cache entry time-to-live in milliseconds.
    #[arg(long, env = "BROKER_DEDUP_TTL_MS", default_value = "600000")]
    pub dedup_ttl_ms: u64,

    /// PTY write timeout in milliseconds before write_blocked.
    #[arg(long, env = "BROKER_WRITE_TIMEOUT_MS", default_value = "500")]
    pub write_timeout_ms: u64,

    /// Per-agent PTY output ring buffer size in bytes.
    #[arg(long, env = "BROKER_RING_SIZE_BYTES", default_value = "262144")]
    pub ring_size_bytes: usize,

    /// Log format: json or text.
    #[arg(long, env = "BROKER_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "BROKER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Where the cloud relay expects its auth token; never the URL query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudTokenSource {
    Subprotocol,
    FirstFrame,
}

impl std::str::FromStr for CloudTokenSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "subprotocol" => Ok(Self::Subprotocol),
            "first_frame" => Ok(Self::FirstFrame),
            other => Err(format!("invalid cloud_token_source: {other}")),
        }
    }
}

impl BrokerConfig {
    /// Validate cross-field constraints that clap's own attributes can't express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dedup_ttl_ms == 0 {
            anyhow::bail!("dedup_ttl_ms must be > 0");
        }
        if self.dedup_cap == 0 {
            anyhow::bail!("dedup_cap must be > 0");
        }
        if self.retry_backoff_ms.is_empty() {
            anyhow::bail!("retry_backoff_ms must have at least one entry");
        }
        if self.retry_backoff_ms.iter().any(|&ms| ms == 0) {
            anyhow::bail!("retry_backoff_ms entries must be > 0");
        }
        if self.max_queue_depth == 0 {
            anyhow::bail!("max_queue_depth must be > 0");
        }
        if self.cloud_token_source == CloudTokenSource::FirstFrame
            && self.cloud_endpoint.is_some()
            && self.cloud_token.is_none()
        {
            anyhow::bail!("cloud_token is required when cloud_endpoint is set");
        }
        Ok(())
    }

    /// Maximum retry attempts for echo_timeout, derived from the backoff ladder.
    pub fn max_delivery_attempts(&self) -> u32 {
        self.retry_backoff_ms.len() as u32 + 1
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
