// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Canonical table of live agents: identity, PTY handle, health, throttle
//! state.
//!
//! Unlike the pod registry this is drawn from, which is shared across tasks
//! behind `Arc<RwLock<HashMap<...>>>` because pods register themselves over
//! HTTP from another process, this registry has exactly one writer: the
//! Broker Core event loop. It is therefore a plain owned struct with `&mut
//! self` mutators, consistent with the broker's single-threaded cooperative
//! concurrency model — no lock is needed because no other task ever touches
//! it.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use indexmap::{IndexMap, IndexSet};

use crate::error::{BrokerError, ErrorKind};

const BUSYNESS_WINDOW: Duration = Duration::from_secs(2);
const PENDING_OUTPUT_WINDOW: Duration = Duration::from_millis(200);
const INJECTION_FLOOR_BASE_MS: u64 = 50;
const INJECTION_FLOOR_CAP_MS: u64 = 2_000;
const INJECTION_FLOOR_MIN_MS: u64 = 25;
const BACKPRESSURE_THRESHOLD: f64 = 0.8;

/// Lifecycle state of an [`Agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Spawning,
    Ready,
    Active,
    Busy,
    Releasing,
    Gone,
}

impl AgentState {
    fn is_terminal(self) -> bool {
        matches!(self, Self::Gone)
    }
}

/// Identity and runtime handle for an agent managed by the broker.
#[derive(Debug, Clone)]
pub struct Agent {
    pub name: String,
    pub runtime_kind: String,
    pub spawn_args: Vec<String>,
    pub cwd: PathBuf,
    pub pid: i32,
    pub pgid: i32,
    pub state: AgentState,
    pub connected_at: Instant,
    pub channels: IndexSet<String>,

    last_output_at: Option<Instant>,
    pending_output: bool,
    recent_output_bytes: Vec<(Instant, usize)>,
    output_baseline_bytes_per_sec: f64,

    consecutive_successes: u32,
    consecutive_failures: u32,
    success_count: u64,
    failure_count: u64,
    injection_floor_delay_ms: u64,
    last_injection_at: Option<Instant>,
}

impl Agent {
    pub fn new(name: impl Into<String>, runtime_kind: impl Into<String>, spawn_args: Vec<String>, cwd: PathBuf, pid: i32, pgid: i32) -> Self {
        Self {
            name: name.into(),
            runtime_kind: runtime_kind.into(),
            spawn_args,
            cwd,
            pid,
            pgid,
            state: AgentState::Spawning,
            connected_at: Instant::now(),
            channels: IndexSet::new(),
            last_output_at: None,
            pending_output: false,
            recent_output_bytes: Vec::new(),
            output_baseline_bytes_per_sec: 512.0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            success_count: 0,
            failure_count: 0,
            injection_floor_delay_ms: INJECTION_FLOOR_MIN_MS,
            last_injection_at: None,
        }
    }

    /// Weighted blend of inter-output rate (vs. baseline) and a
    /// pending-output indicator, clamped to `[0, 1]`.
    pub fn busyness(&self, now: Instant) -> f64 {
        let rate_component = {
            let window_start = now.checked_sub(BUSYNESS_WINDOW).unwrap_or(now);
            let bytes: usize = self
                .recent_output_bytes
                .iter()
                .filter(|(t, _)| *t >= window_start)
                .map(|(_, n)| *n)
                .sum();
            let rate = bytes as f64 / BUSYNESS_WINDOW.as_secs_f64();
            (rate / self.output_baseline_bytes_per_sec.max(1.0)).min(1.0)
        };
        let pending_component = if self.pending_output
            && self.last_output_at.map(|t| now.duration_since(t) <= PENDING_OUTPUT_WINDOW).unwrap_or(false)
        {
            1.0
        } else {
            0.0
        };
        (0.5 * rate_component + 0.5 * pending_component).clamp(0.0, 1.0)
    }

    pub fn is_backpressured(&self, now: Instant) -> bool {
        self.busyness(now) >= BACKPRESSURE_THRESHOLD
    }

    pub fn injection_floor_delay(&self) -> Duration {
        Duration::from_millis(self.injection_floor_delay_ms)
    }

    pub fn ready_for_injection(&self, now: Instant) -> bool {
        match self.last_injection_at {
            Some(t) => now.duration_since(t) >= self.injection_floor_delay(),
            None => true,
        }
    }

    fn record_injection(&mut self, now: Instant) {
        self.last_injection_at = Some(now);
    }

    fn record_success(&mut self) {
        self.success_count += 1;
        self.consecutive_failures = 0;
        self.consecutive_successes += 1;
        self.injection_floor_delay_ms = (self.injection_floor_delay_ms / 2).max(INJECTION_FLOOR_MIN_MS);
    }

    fn record_failure(&mut self) {
        self.failure_count += 1;
        self.consecutive_successes = 0;
        self.consecutive_failures += 1;
        let next = self.injection_floor_delay_ms.saturating_mul(2).max(INJECTION_FLOOR_BASE_MS);
        self.injection_floor_delay_ms = next.min(INJECTION_FLOOR_CAP_MS);
    }

    fn mark_output(&mut self, now: Instant, bytes: usize) {
        self.last_output_at = Some(now);
        self.pending_output = true;
        self.recent_output_bytes.push((now, bytes));
        let window_start = now.checked_sub(BUSYNESS_WINDOW * 4).unwrap_or(now);
        self.recent_output_bytes.retain(|(t, _)| *t >= window_start);
    }

    fn mark_idle(&mut self) {
        self.pending_output = false;
    }
}

/// Canonical table of live agents and channel membership.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    agents: IndexMap<String, Agent>,
    channels: IndexMap<String, IndexSet<String>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new agent. Fails with `name_conflict` if a non-`gone`
    /// agent already holds this name.
    pub fn register(&mut self, agent: Agent) -> Result<(), BrokerError> {
        if let Some(existing) = self.agents.get(&agent.name) {
            if !existing.state.is_terminal() {
                return Err(BrokerError::new(
                    ErrorKind::NameConflict,
                    format!("agent '{}' is already registered", agent.name),
                ));
            }
        }
        for channel in agent.channels.clone() {
            self.channels.entry(channel).or_default().insert(agent.name.clone());
        }
        self.agents.insert(agent.name.clone(), agent);
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<&Agent> {
        self.agents.get(name)
    }

    pub fn lookup_mut(&mut self, name: &str) -> Option<&mut Agent> {
        self.agents.get_mut(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &Agent> {
        self.agents.values()
    }

    /// Resolve an addressee to concrete agent names. `*` fans out to every
    /// live agent in registration order; `#name` resolves channel
    /// membership in join order; anything else is an exact name lookup.
    pub fn resolve_targets(&self, addressee: &str) -> Vec<String> {
        if addressee == "*" {
            return self
                .agents
                .values()
                .filter(|a| !a.state.is_terminal())
                .map(|a| a.name.clone())
                .collect();
        }
        if let Some(channel) = addressee.strip_prefix('#') {
            return self
                .channels
                .get(channel)
                .map(|members| {
                    members
                        .iter()
                        .filter(|name| self.agents.get(*name).map(|a| !a.state.is_terminal()).unwrap_or(false))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
        }
        match self.agents.get(addressee) {
            Some(a) if !a.state.is_terminal() => vec![a.name.clone()],
            _ => vec![],
        }
    }

    pub fn set_subscription(&mut self, name: &str, channels: Vec<String>) -> Result<(), BrokerError> {
        let agent = self
            .agents
            .get_mut(name)
            .ok_or_else(|| BrokerError::new(ErrorKind::AgentGone, format!("unknown agent '{name}'")))?;

        for old in agent.channels.difference(&channels.iter().cloned().collect()).cloned().collect::<Vec<_>>() {
            if let Some(members) = self.channels.get_mut(&old) {
                members.shift_remove(name);
            }
        }
        let new_set: IndexSet<String> = channels.into_iter().collect();
        for channel in &new_set {
            self.channels.entry(channel.clone()).or_default().insert(name.to_owned());
        }
        agent.channels = new_set;
        Ok(())
    }

    pub fn mark_output(&mut self, name: &str, now: Instant, bytes: usize) {
        if let Some(agent) = self.agents.get_mut(name) {
            agent.mark_output(now, bytes);
        }
    }

    pub fn mark_idle(&mut self, name: &str) {
        if let Some(agent) = self.agents.get_mut(name) {
            if agent.state == AgentState::Spawning {
                agent.state = AgentState::Ready;
            }
            agent.mark_idle();
        }
    }

    pub fn record_injection(&mut self, name: &str, now: Instant) {
        if let Some(agent) = self.agents.get_mut(name) {
            agent.record_injection(now);
        }
    }

    /// Recompute `state` among `ready`/`active`/`busy` for an agent that is
    /// already past `spawning`. `in_flight` is whether the agent currently
    /// has an injected delivery awaiting its outcome; busyness crossing the
    /// backpressure threshold always wins over that, matching `busy` taking
    /// priority over `active` in the documented lifecycle. Leaves
    /// `spawning`/`releasing`/`gone` untouched.
    pub fn refresh_activity_state(&mut self, name: &str, in_flight: bool, now: Instant) {
        if let Some(agent) = self.agents.get_mut(name) {
            if !matches!(agent.state, AgentState::Ready | AgentState::Active | AgentState::Busy) {
                return;
            }
            agent.state = if agent.is_backpressured(now) {
                AgentState::Busy
            } else if in_flight {
                AgentState::Active
            } else {
                AgentState::Ready
            };
        }
    }

    pub fn record_success(&mut self, name: &str) {
        if let Some(agent) = self.agents.get_mut(name) {
            agent.record_success();
        }
    }

    pub fn record_failure(&mut self, name: &str, _reason: &str) {
        if let Some(agent) = self.agents.get_mut(name) {
            agent.record_failure();
        }
    }

    /// Mark an agent `gone` and drop its channel memberships. The name is
    /// freed for re-registration immediately; `remove` is only called after
    /// the PTY Supervisor has confirmed reap.
    pub fn remove(&mut self, name: &str) {
        if let Some(agent) = self.agents.get_mut(name) {
            agent.state = AgentState::Gone;
            for channel in agent.channels.clone() {
                if let Some(members) = self.channels.get_mut(&channel) {
                    members.shift_remove(name);
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
