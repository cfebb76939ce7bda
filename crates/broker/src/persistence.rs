// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Atomic registry snapshots and the durable outbound-delivery log, plus the
//! directory-scoped advisory lock that keeps two brokers from sharing a
//! state directory.
//!
//! Both artifacts are written the same way: build the new contents in a
//! temporary file in the same directory, `fsync`, then `rename` over the
//! target. A rename within one filesystem is atomic, so a reader never
//! observes a half-written file.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::delivery::{DeliveryState, Priority};
use crate::error::{BrokerError, ErrorKind, Result};
use crate::registry::Agent;

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Directory-scoped advisory lock. Held for the lifetime of the broker
/// process; removed on drop. Does not adopt a lock file left by a dead
/// process — it's overwritten instead, since a stale lock must never block
/// a legitimate restart.
pub struct BrokerLock {
    path: PathBuf,
}

impl BrokerLock {
    pub fn acquire(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(BrokerError::from)?;
        let path = dir.join("broker.lock");
        if let Some(existing_pid) = read_lock_pid(&path) {
            if pid_is_alive(existing_pid) {
                return Err(BrokerError::new(ErrorKind::LockHeld, format!("broker.lock held by pid {existing_pid}")));
            }
        }
        std::fs::write(&path, std::process::id().to_string()).map_err(BrokerError::from)?;
        Ok(Self { path })
    }
}

impl Drop for BrokerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn read_lock_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn pid_is_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// On-disk shape of one agent in the registry snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub name: String,
    pub runtime_kind: String,
    pub spawn_args: Vec<String>,
    pub cwd: PathBuf,
    pub pid: i32,
    pub pgid: i32,
    pub connected_at_ms: i64,
}

impl AgentSnapshot {
    pub fn from_agent(agent: &Agent, connected_at_ms: i64) -> Self {
        Self {
            name: agent.name.clone(),
            runtime_kind: agent.runtime_kind.clone(),
            spawn_args: agent.spawn_args.clone(),
            cwd: agent.cwd.clone(),
            pid: agent.pid,
            pgid: agent.pgid,
            connected_at_ms,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub agents: Vec<AgentSnapshot>,
}

/// Write `snapshot` to `<dir>/state.json` atomically.
pub fn write_snapshot_atomic(dir: &Path, snapshot: &RegistrySnapshot) -> Result<()> {
    let final_path = dir.join("state.json");
    let tmp_path = dir.join("state.json.tmp");
    let json = serde_json::to_vec_pretty(snapshot).map_err(|e| BrokerError::new(ErrorKind::IoError, e.to_string()))?;
    write_atomic(&tmp_path, &final_path, &json)
}

/// Read `<dir>/state.json`. `Ok(None)` means no snapshot exists yet.
pub fn read_snapshot(dir: &Path) -> Result<Option<RegistrySnapshot>> {
    let path = dir.join("state.json");
    match std::fs::read(&path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BrokerError::from(e)),
    }
}

fn write_atomic(tmp_path: &Path, final_path: &Path, contents: &[u8]) -> Result<()> {
    {
        let mut file = std::fs::File::create(tmp_path).map_err(BrokerError::from)?;
        file.write_all(contents).map_err(BrokerError::from)?;
        file.sync_all().map_err(BrokerError::from)?;
    }
    std::fs::rename(tmp_path, final_path).map_err(BrokerError::from)?;
    Ok(())
}

/// Debounces registry-snapshot writes so a burst of changes produces one
/// flush, not one per change.
pub struct SnapshotDebouncer {
    debounce: Duration,
    dirty: bool,
    last_flush: Option<std::time::Instant>,
}

impl SnapshotDebouncer {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, dirty: false, last_flush: None }
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn ready(&self, now: std::time::Instant) -> bool {
        self.dirty && self.last_flush.map(|t| now.duration_since(t) >= self.debounce).unwrap_or(true)
    }

    pub fn mark_flushed(&mut self, now: std::time::Instant) {
        self.dirty = false;
        self.last_flush = Some(now);
    }

    pub fn next_deadline(&self) -> Option<std::time::Instant> {
        if !self.dirty {
            return None;
        }
        Some(self.last_flush.map(|t| t + self.debounce).unwrap_or_else(std::time::Instant::now))
    }
}

/// One line of the pending-deliveries log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PendingLogRecord {
    Enqueue {
        delivery_id: String,
        message_id: String,
        from: String,
        to: String,
        body: Value,
        thread_id: Option<String>,
        priority: Priority,
        recorded_at_ms: i64,
    },
    Transition {
        delivery_id: String,
        state: DeliveryState,
        recorded_at_ms: i64,
    },
    Ack {
        delivery_id: String,
        recorded_at_ms: i64,
    },
    Fail {
        delivery_id: String,
        reason: String,
        recorded_at_ms: i64,
    },
    /// A cloud-publish job that exhausted its retry budget without ever
    /// reaching `publish_ok`. Dead-lettered independently of any local
    /// delivery: cloud publish and local injection are tracked separately,
    /// so this carries the client-supplied `message_id`, not a delivery id.
    Abandoned {
        message_id: String,
        channel: String,
        reason: String,
        recorded_at_ms: i64,
    },
}

impl PendingLogRecord {
    /// `None` for records not keyed by a local delivery id (currently just
    /// `Abandoned`), which `compact`/replay-reconstruction skip over.
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Self::Enqueue { delivery_id, .. }
            | Self::Transition { delivery_id, .. }
            | Self::Ack { delivery_id, .. }
            | Self::Fail { delivery_id, .. } => Some(delivery_id),
            Self::Abandoned { .. } => None,
        }
    }

    fn recorded_at_ms(&self) -> i64 {
        match self {
            Self::Enqueue { recorded_at_ms, .. }
            | Self::Transition { recorded_at_ms, .. }
            | Self::Ack { recorded_at_ms, .. }
            | Self::Fail { recorded_at_ms, .. }
            | Self::Abandoned { recorded_at_ms, .. } => *recorded_at_ms,
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::Ack { .. } | Self::Fail { .. })
    }
}

/// Append-only `pending.jsonl`, periodically compacted.
pub struct PendingLog {
    path: PathBuf,
}

impl PendingLog {
    pub fn new(dir: &Path) -> Self {
        Self { path: dir.join("pending.jsonl") }
    }

    pub fn append(&self, record: &PendingLogRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| BrokerError::new(ErrorKind::IoError, e.to_string()))?;
        line.push('\n');
        let mut file =
            std::fs::OpenOptions::new().create(true).append(true).open(&self.path).map_err(BrokerError::from)?;
        file.write_all(line.as_bytes()).map_err(BrokerError::from)?;
        file.sync_data().map_err(BrokerError::from)?;
        Ok(())
    }

    /// Replay the full log in file order, used on startup to reconstruct
    /// in-flight deliveries.
    pub fn replay(&self) -> Result<Vec<PendingLogRecord>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BrokerError::from(e)),
        };
        Ok(contents.lines().filter_map(|line| serde_json::from_str(line).ok()).collect())
    }

    /// Collapse the log to one `Enqueue` plus its latest known outcome per
    /// delivery, dropping deliveries whose latest record is terminal and
    /// older than `retention`. Standalone records with no delivery id (e.g.
    /// `Abandoned`) are kept or dropped by their own age against the same
    /// retention window.
    pub fn compact(&self, retention: Duration, now_ms: i64) -> Result<()> {
        let records = self.replay()?;
        let mut enqueues: HashMap<String, PendingLogRecord> = HashMap::new();
        let mut latest: HashMap<String, PendingLogRecord> = HashMap::new();
        let mut standalone: Vec<PendingLogRecord> = Vec::new();

        for record in records {
            match record.delivery_id() {
                Some(id) => {
                    let id = id.to_owned();
                    match &record {
                        PendingLogRecord::Enqueue { .. } => {
                            enqueues.insert(id, record);
                        }
                        _ => {
                            latest.insert(id, record);
                        }
                    }
                }
                None => {
                    if now_ms.saturating_sub(record.recorded_at_ms()) <= retention.as_millis() as i64 {
                        standalone.push(record);
                    }
                }
            }
        }

        let mut kept = Vec::new();
        for (id, enqueue) in &enqueues {
            if let Some(outcome) = latest.get(id) {
                if outcome.is_terminal() && now_ms.saturating_sub(outcome.recorded_at_ms()) > retention.as_millis() as i64 {
                    continue;
                }
            }
            kept.push(enqueue.clone());
            if let Some(outcome) = latest.get(id) {
                kept.push(outcome.clone());
            }
        }
        kept.extend(standalone);

        let tmp_path = self.path.with_extension("jsonl.tmp");
        let mut buf = Vec::new();
        for record in &kept {
            let mut line = serde_json::to_string(record).map_err(|e| BrokerError::new(ErrorKind::IoError, e.to_string()))?;
            line.push('\n');
            buf.extend_from_slice(line.as_bytes());
        }
        write_atomic(&tmp_path, &self.path, &buf)
    }
}

pub fn current_time_ms() -> i64 {
    now_ms()
}

#[cfg(test)]
#[path = "persistence_tests.rs"]
mod tests;
