// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The Broker Core: a single-threaded cooperative event loop that owns every
//! piece of coordination state (registry, delivery engine, scheduler, dedup
//! cache, output scanner, persistence). Nothing outside this module ever
//! mutates that state directly; I/O tasks (the control-channel reader, each
//! agent's PTY pump, the cloud mirror) only ever produce a [`CoreEvent`] and
//! hand it to the core's single event queue.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cloud::{self, CloudEvent, CloudMirrorConfig, CloudMirrorHandle, OutboundPublishJob};
use crate::config::BrokerConfig;
use crate::dedup::DedupCache;
use crate::delivery::{DeliveryEngine, DeliveryState, Priority, Receipt};
use crate::error::ErrorKind;
use crate::event::{ClientRequest, CoreEvent, RequestKind};
use crate::frame::{Frame, FrameReader};
use crate::persistence::{
    current_time_ms, AgentSnapshot, BrokerLock, PendingLog, PendingLogRecord, RegistrySnapshot, SnapshotDebouncer,
};
use crate::pty::spawn::NativePty;
use crate::pty::{Boxed, ExitStatus, PtySupervisor, PtyWriter, SupervisorEvent};
use crate::registry::{Agent, AgentState, WorkerRegistry};
use crate::scanner::OutputScanner;
use crate::scheduler::Scheduler;

const SNAPSHOT_DEBOUNCE: Duration = Duration::from_millis(50);
const PENDING_LOG_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
const DELIVERY_RETENTION: Duration = Duration::from_secs(60);
const SCHEDULER_TICK: Duration = Duration::from_millis(5);
const COMPACT_INTERVAL: Duration = Duration::from_secs(300);
const DEFAULT_TERM: &str = "xterm-256color";
const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 40;

/// Per-agent state the core keeps alongside the registry: the cheap PTY
/// write handle, the release signal, and the rolling window of raw output
/// bytes since the last injection (what the scanner matches echo/activity
/// against).
struct AgentHandle {
    writer: PtyWriter,
    release_tx: Option<oneshot::Sender<Option<u64>>>,
    pump: tokio::task::JoinHandle<Option<ExitStatus>>,
    scan_window: Vec<u8>,
    active_injection: Option<String>,
}

/// Runs to completion, exiting when `shutdown` requests or the client
/// control channel closes. Owns no state once dropped.
pub struct BrokerCore {
    config: BrokerConfig,
    registry: WorkerRegistry,
    deliveries: DeliveryEngine,
    scheduler: Scheduler,
    dedup: DedupCache,
    scanner: OutputScanner,
    cloud: CloudMirrorHandle,
    pending_log: PendingLog,
    snapshot_debouncer: SnapshotDebouncer,
    _lock: BrokerLock,
    agents: HashMap<String, AgentHandle>,
    injecting: HashSet<String>,
    events_tx: mpsc::Sender<CoreEvent>,
    events_rx: mpsc::Receiver<CoreEvent>,
    out_tx: mpsc::Sender<Vec<u8>>,
    last_compact: Instant,
    shutting_down: bool,
}

impl BrokerCore {
    /// Acquire the state-directory lock, replay persisted state, and start
    /// the control-channel reader/writer and cloud mirror tasks. Returns the
    /// core plus the stdout-writer pump's join handle, which the caller
    /// should await after `run` returns so the last frames are flushed.
    pub async fn start(config: BrokerConfig, shutdown: CancellationToken) -> anyhow::Result<(Self, tokio::task::JoinHandle<()>)> {
        std::fs::create_dir_all(&config.state_dir)?;
        let lock = BrokerLock::acquire(&config.state_dir)?;

        let mut scanner = OutputScanner::with_builtin_defaults(config.echo_window_bytes);
        if let Some(path) = &config.activity_patterns_path {
            scanner.reload(path)?;
        }

        let (events_tx, events_rx) = mpsc::channel(1024);
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(256);

        spawn_stdin_reader(events_tx.clone(), shutdown.clone());
        let writer_task = spawn_stdout_writer(out_rx);

        let cloud = cloud::spawn(
            CloudMirrorConfig {
                endpoint: config.cloud_endpoint.clone(),
                token: config.cloud_token.clone(),
                token_source: config.cloud_token_source,
            },
            cloud_events_tx(events_tx.clone()),
        );

        let mut deliveries = DeliveryEngine::new(
            config.max_delivery_attempts(),
            config.retry_backoff_ms.clone(),
            Duration::from_millis(config.echo_window_ms),
            Duration::from_millis(config.activity_window_ms),
        );
        let mut scheduler = Scheduler::new(config.max_queue_depth);

        let pending_log = PendingLog::new(&config.state_dir);
        let recovered = reconstruct_pending_deliveries(pending_log.replay()?);
        if !recovered.is_empty() {
            info!(count = recovered.len(), "restoring in-flight deliveries from pending log");
            for r in recovered {
                scheduler.enqueue(&r.to, r.priority, r.delivery_id.clone());
                deliveries.restore_queued(r.delivery_id, r.message_id, r.from, r.to, r.body, r.thread_id, r.priority, r.attempt);
            }
        }
        // The registry snapshot records each agent's last known `{pid, pgid}`
        // but never a reopenable PTY master handle, so the master side can
        // never be reacquired across a restart; every agent is therefore
        // `gone` on a fresh process and must be respawned under its name
        // before the deliveries restored above can be injected.

        let core = Self {
            scheduler,
            dedup: DedupCache::new(config.dedup_cap, Duration::from_millis(config.dedup_ttl_ms)),
            pending_log,
            snapshot_debouncer: SnapshotDebouncer::new(SNAPSHOT_DEBOUNCE),
            registry: WorkerRegistry::new(),
            deliveries,
            scanner,
            cloud,
            _lock: lock,
            agents: HashMap::new(),
            injecting: HashSet::new(),
            events_tx,
            events_rx,
            out_tx,
            last_compact: Instant::now(),
            shutting_down: false,
            config,
        };
        Ok((core, writer_task))
    }

    /// The main select loop. Returns once a `shutdown` request is handled or
    /// the control channel closes.
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            if self.shutting_down {
                break;
            }
            let tick_deadline = self.next_tick_deadline();

            tokio::select! {
                biased;

                _ = shutdown.cancelled(), if !self.shutting_down => {
                    info!("broker shutdown requested");
                    self.do_shutdown().await;
                    break;
                }

                event = self.events_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("event queue closed, shutting down");
                            self.do_shutdown().await;
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(tick_deadline.into()) => {
                    self.on_tick().await;
                }
            }
        }
    }

    fn next_tick_deadline(&self) -> Instant {
        let now = Instant::now();
        let mut deadline = now + SCHEDULER_TICK;
        if let Some(d) = self.deliveries.next_deadline() {
            deadline = deadline.min(d.max(now));
        }
        if let Some(d) = self.snapshot_debouncer.next_deadline() {
            deadline = deadline.min(d.max(now));
        }
        deadline
    }

    async fn handle_event(&mut self, event: CoreEvent) {
        match event {
            CoreEvent::Client(req) => self.handle_client_request(req).await,
            CoreEvent::ClientClosed => {
                debug!("control channel closed by client");
                self.do_shutdown().await;
                self.shutting_down = true;
            }
            CoreEvent::AgentOutput { agent, event } => self.handle_agent_output(agent, event).await,
            CoreEvent::Cloud(event) => self.handle_cloud_event(event).await,
            CoreEvent::SchedulerTick => self.on_tick().await,
        }
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        let elapsed = self.deliveries_with_elapsed_timers();
        for delivery_id in elapsed {
            if let Some(receipt) = self.deliveries.poll_timeout(&delivery_id, now) {
                self.on_delivery_transition(&receipt, now).await;
            }
        }

        loop {
            for delivery_id in self.deliveries.ready_to_schedule(now) {
                let Some(delivery) = self.deliveries.get(&delivery_id) else { continue };
                self.scheduler.enqueue(&delivery.to, delivery.priority, delivery_id);
            }
            let Some(scheduled) = self.scheduler.tick(now, &self.registry, &self.injecting) else { break };
            self.inject(scheduled.agent, scheduled.delivery_id, now).await;
        }

        let names: Vec<String> = self.registry.list().map(|a| a.name.clone()).collect();
        for name in &names {
            self.registry.refresh_activity_state(name, self.injecting.contains(name), now);
        }

        let backpressured: Vec<(String, f64)> = self
            .registry
            .list()
            .filter(|a| a.is_backpressured(now))
            .map(|a| (a.name.clone(), a.busyness(now)))
            .collect();
        for (agent_name, busyness) in backpressured {
            let dropped = self.scheduler.shed(&agent_name, busyness);
            for delivery_id in dropped {
                if let Some(receipt) = self.fail_delivery(&delivery_id, "shed") {
                    self.on_delivery_transition(&receipt, now).await;
                }
            }
        }

        self.deliveries.gc_terminal(DELIVERY_RETENTION, now);

        if self.snapshot_debouncer.ready(now) {
            self.flush_snapshot(now);
        }
        if now.duration_since(self.last_compact) >= COMPACT_INTERVAL {
            self.last_compact = now;
            if let Err(e) = self.pending_log.compact(PENDING_LOG_RETENTION, current_time_ms()) {
                warn!(err = %e, "pending log compaction failed");
            }
        }
    }

    /// Deliveries with an outstanding echo or activity deadline. Invariant 1
    /// (at most one in-flight injection per agent) means this is exactly
    /// each agent's `active_injection`, so no separate index is needed.
    fn deliveries_with_elapsed_timers(&self) -> Vec<String> {
        self.agents.values().filter_map(|h| h.active_injection.clone()).collect()
    }

    async fn handle_client_request(&mut self, req: ClientRequest) {
        let request_id = req.request_id.clone();
        let response = match req.kind {
            RequestKind::Spawn(spawn) => self.handle_spawn(spawn).await,
            RequestKind::Release(release) => self.handle_release(release).await,
            RequestKind::SendMessage(send) => self.handle_send_message(send).await,
            RequestKind::SetSubscription(sub) => self.handle_set_subscription(sub),
            RequestKind::ListAgents => self.handle_list_agents(),
            RequestKind::GetMetrics => self.handle_get_metrics(),
            RequestKind::Shutdown => {
                self.shutting_down = true;
                json!({"ok": true})
            }
        };
        self.emit("response", response, request_id).await;
    }

    async fn handle_spawn(&mut self, req: crate::event::SpawnRequest) -> Value {
        if self.registry.lookup(&req.name).map(|a| a.state != AgentState::Gone).unwrap_or(false) {
            return json!({"error": ErrorKind::NameConflict.as_str(), "reason": format!("agent '{}' already registered", req.name)});
        }

        let env: Vec<(String, String)> = req.env.into_iter().collect();
        let backend = match NativePty::spawn(&req.argv, &req.cwd, &env, DEFAULT_TERM, DEFAULT_COLS, DEFAULT_ROWS) {
            Ok(backend) => backend,
            Err(e) => {
                warn!(agent = %req.name, err = %e, "spawn failed");
                return json!({"error": ErrorKind::SpawnFailed.as_str(), "reason": e.to_string()});
            }
        };

        let supervisor = PtySupervisor::spawn_with_backend(
            req.name.clone(),
            backend.boxed(),
            self.config.ring_size_bytes,
            Duration::from_millis(self.config.write_timeout_ms),
        );
        let pid = supervisor.pid();
        let pgid = supervisor.pgid();
        let writer = supervisor.writer();

        let (release_tx, release_rx) = oneshot::channel();
        let pump = spawn_agent_pump(req.name.clone(), supervisor, release_rx, self.events_tx.clone());

        let mut agent = Agent::new(&req.name, &req.runtime, req.argv.clone(), req.cwd.clone(), pid, pgid);
        agent.state = AgentState::Spawning;
        for channel in &req.channels {
            agent.channels.insert(channel.clone());
        }
        if let Err(e) = self.registry.register(agent) {
            let _ = release_tx.send(None);
            return json!({"error": e.kind.as_str(), "reason": e.reason});
        }

        self.agents.insert(
            req.name.clone(),
            AgentHandle { writer, release_tx: Some(release_tx), pump, scan_window: Vec::new(), active_injection: None },
        );
        self.snapshot_debouncer.mark_dirty();
        self.emit("agent_ready", json!({"name": req.name, "pid": pid}), None).await;
        json!({"ok": true, "pid": pid})
    }

    async fn handle_release(&mut self, req: crate::event::ReleaseRequest) -> Value {
        let Some(mut handle) = self.agents.remove(&req.name) else {
            return json!({"error": ErrorKind::AgentGone.as_str(), "reason": format!("unknown agent '{}'", req.name)});
        };
        if let Some(agent) = self.registry.lookup_mut(&req.name) {
            agent.state = AgentState::Releasing;
        }
        if let Some(tx) = handle.release_tx.take() {
            let _ = tx.send(req.grace_ms);
        }
        // The pump still forwards its own `Exited` event through `events_tx`
        // once it resolves; `handle_agent_output` does the registry/delivery
        // cleanup and the `agent_gone` emission when that event is drained.
        // Removing the handle here just stops it from being addressed again
        // (e.g. a second `release`) while the pump winds down.
        let status = handle.pump.await.unwrap_or_default();
        match status {
            Some(status) => json!({"ok": true, "exit_code": status.code, "signal": status.signal}),
            None => json!({"ok": true, "exit_code": Value::Null, "signal": Value::Null}),
        }
    }

    async fn handle_send_message(&mut self, req: crate::event::SendMessageRequest) -> Value {
        let message_id = Uuid::new_v4().to_string();
        let local_targets = self.registry.resolve_targets(&req.to);
        let is_channel = req.to.starts_with('#') || req.to == "*";
        let priority = req.priority.unwrap_or(if is_channel { Priority::default_channel() } else { Priority::default_direct() });
        let body = json!({"text": req.text});

        for target in &local_targets {
            let delivery_id = self.deliveries.enqueue(
                message_id.clone(),
                req.from.clone(),
                target.clone(),
                body.clone(),
                req.thread_id.clone(),
                priority,
            );
            let _ = self.pending_log.append(&PendingLogRecord::Enqueue {
                delivery_id: delivery_id.clone(),
                message_id: message_id.clone(),
                from: req.from.clone(),
                to: target.clone(),
                body: body.clone(),
                thread_id: req.thread_id.clone(),
                priority,
                recorded_at_ms: current_time_ms(),
            });
            self.scheduler.enqueue(target, priority, delivery_id.clone());
            self.emit(
                "delivery_queued",
                json!({"delivery_id": delivery_id, "message_id": message_id, "to": target}),
                None,
            )
            .await;
        }

        self.dedup.insert(message_id.clone());
        let published = self
            .cloud
            .publish(OutboundPublishJob::new(message_id.clone(), req.to.clone(), body))
            .await;

        json!({"message_id": message_id, "local_targets": local_targets, "published": published})
    }

    fn handle_set_subscription(&mut self, req: crate::event::SetSubscriptionRequest) -> Value {
        match self.registry.set_subscription(&req.name, req.channels) {
            Ok(()) => json!({"ok": true}),
            Err(e) => json!({"error": e.kind.as_str(), "reason": e.reason}),
        }
    }

    fn handle_list_agents(&self) -> Value {
        let now = Instant::now();
        let list: Vec<Value> = self
            .registry
            .list()
            .map(|a| {
                json!({
                    "name": a.name,
                    "state": a.state,
                    "pid": a.pid,
                    "busyness": a.busyness(now),
                    "queue_depth": self.scheduler.depth(&a.name),
                })
            })
            .collect();
        Value::Array(list)
    }

    fn handle_get_metrics(&self) -> Value {
        let counts: HashMap<&str, usize> = self.deliveries.state_counts().into_iter().collect();
        json!({
            "agents": self.registry.list().count(),
            "deliveries": counts,
            "dedup_size": self.dedup.len(),
            "publish_backlog": self.cloud.backlog(),
        })
    }

    async fn handle_agent_output(&mut self, agent: String, event: SupervisorEvent) {
        let now = Instant::now();
        match event {
            SupervisorEvent::Output { data, .. } => {
                self.registry.mark_output(&agent, now, data.len());
                let Some(handle) = self.agents.get_mut(&agent) else { return };
                handle.scan_window.extend_from_slice(&data);
                let cap = self.scanner.echo_window_bytes();
                if handle.scan_window.len() > cap {
                    let drop = handle.scan_window.len() - cap;
                    handle.scan_window.drain(0..drop);
                }
                self.run_scanner(&agent, now).await;
            }
            SupervisorEvent::OutputTruncated { dropped } => {
                self.emit("output_truncated", json!({"name": agent, "dropped": dropped}), None).await;
            }
            SupervisorEvent::Exited(status) => {
                self.registry.remove(&agent);
                self.agents.remove(&agent);
                self.injecting.remove(&agent);
                for id in self.scheduler.drain_agent(&agent) {
                    if let Some(receipt) = self.fail_delivery(&id, "agent_gone") {
                        self.on_delivery_transition(&receipt, now).await;
                    }
                }
                let failed = self.deliveries.fail_all_for_agent(&agent);
                for receipt in failed {
                    self.on_delivery_transition(&receipt, now).await;
                }
                self.snapshot_debouncer.mark_dirty();
                self.emit("agent_gone", json!({"name": agent, "code": status.code, "signal": status.signal}), None).await;
            }
        }
    }

    async fn run_scanner(&mut self, agent: &str, now: Instant) {
        let Some(runtime_kind) = self.registry.lookup(agent).map(|a| a.runtime_kind.clone()) else { return };
        let Some(handle) = self.agents.get(agent) else { return };
        let window = handle.scan_window.clone();

        if let Some(delivery_id) = handle.active_injection.clone() {
            if let Some(delivery) = self.deliveries.get(&delivery_id) {
                let body = delivery.body.get("text").and_then(Value::as_str).unwrap_or_default().to_owned();
                match &delivery.state {
                    DeliveryState::Injected => {
                        if self.scanner.scan_echo(&window, &body) {
                            if let Some(receipt) = self.deliveries.mark_echo_matched(&delivery_id, now) {
                                self.on_delivery_transition(&receipt, now).await;
                            }
                        }
                    }
                    DeliveryState::Verified => {
                        if self.scanner.scan_activity(&runtime_kind, &window) {
                            if let Some(receipt) = self.deliveries.mark_activity_observed(&delivery_id) {
                                self.on_delivery_transition(&receipt, now).await;
                                if let Some(handle) = self.agents.get_mut(agent) {
                                    handle.active_injection = None;
                                }
                                self.injecting.remove(agent);
                                self.registry.refresh_activity_state(agent, false, now);
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        if self.scanner.scan_idle(&runtime_kind, &window) {
            self.registry.mark_idle(agent);
        }
    }

    async fn handle_cloud_event(&mut self, event: CloudEvent) {
        match event {
            CloudEvent::PublishOk { .. } => {
                self.cloud.mark_resolved();
            }
            CloudEvent::PublishAbandoned { message_id, channel, reason } => {
                self.cloud.mark_resolved();
                let _ = self.pending_log.append(&PendingLogRecord::Abandoned {
                    message_id: message_id.clone(),
                    channel,
                    reason: reason.clone(),
                    recorded_at_ms: current_time_ms(),
                });
                self.emit("publish_failed", json!({"message_id": message_id, "reason": reason}), None).await;
            }
            CloudEvent::EchoReceived(echo) => {
                if self.dedup.seen(echo.event_id.clone()) {
                    return;
                }
                let targets = self.registry.resolve_targets(&echo.channel);
                let body = json!({"text": echo.text});
                let now = Instant::now();
                for target in targets {
                    let delivery_id = self.deliveries.enqueue(
                        echo.event_id.clone(),
                        echo.from.clone(),
                        target.clone(),
                        body.clone(),
                        None,
                        Priority::default_channel(),
                    );
                    let _ = self.pending_log.append(&PendingLogRecord::Enqueue {
                        delivery_id: delivery_id.clone(),
                        message_id: echo.event_id.clone(),
                        from: echo.from.clone(),
                        to: target.clone(),
                        body: body.clone(),
                        thread_id: None,
                        priority: Priority::default_channel(),
                        recorded_at_ms: current_time_ms(),
                    });
                    self.scheduler.enqueue(&target, Priority::default_channel(), delivery_id);
                }
                let _ = now;
            }
        }
    }

    async fn inject(&mut self, agent: String, delivery_id: String, now: Instant) {
        let Some(delivery) = self.deliveries.get(&delivery_id) else { return };
        let text = delivery.body.get("text").and_then(Value::as_str).unwrap_or_default().to_owned();

        // Scoped so the `handle` borrow ends before `on_delivery_transition`
        // below needs `&mut self` again.
        let write_result = {
            let Some(handle) = self.agents.get_mut(&agent) else {
                if let Some(receipt) = self.fail_delivery(&delivery_id, "agent_gone") {
                    self.on_delivery_transition(&receipt, now).await;
                }
                return;
            };
            self.injecting.insert(agent.clone());
            let payload = Bytes::from(format!("{text}\r"));
            handle.writer.write(payload).await
        };

        match write_result {
            Ok(()) => {
                if let Some(handle) = self.agents.get_mut(&agent) {
                    handle.scan_window.clear();
                    handle.active_injection = Some(delivery_id.clone());
                }
                self.registry.record_injection(&agent, now);
                self.registry.refresh_activity_state(&agent, true, now);
                if let Some(receipt) = self.deliveries.mark_injected(&delivery_id, now) {
                    self.on_delivery_transition(&receipt, now).await;
                }
            }
            Err(e) => {
                self.injecting.remove(&agent);
                self.registry.record_failure(&agent, e.kind.as_str());
                if let Some(receipt) = self.deliveries.mark_write_failed(&delivery_id) {
                    self.on_delivery_transition(&receipt, now).await;
                }
            }
        }
    }

    fn fail_delivery(&mut self, delivery_id: &str, reason: &str) -> Option<Receipt> {
        self.deliveries.fail(delivery_id, reason)
    }

    async fn on_delivery_transition(&mut self, receipt: &Receipt, now: Instant) {
        let _ = self.pending_log.append(&match &receipt.state {
            DeliveryState::Acked => PendingLogRecord::Ack { delivery_id: receipt.delivery_id.clone(), recorded_at_ms: current_time_ms() },
            DeliveryState::Failed { reason } => {
                PendingLogRecord::Fail { delivery_id: receipt.delivery_id.clone(), reason: reason.clone(), recorded_at_ms: current_time_ms() }
            }
            other => PendingLogRecord::Transition { delivery_id: receipt.delivery_id.clone(), state: other.clone(), recorded_at_ms: current_time_ms() },
        });

        // `Queued` only reaches here via `poll_timeout`'s echo-timeout retry
        // (Injected -> Queued); the in-flight injection it was waiting on is
        // over, so the agent must be freed up for the scheduler to re-pick it.
        if receipt.state.is_terminal() || matches!(receipt.state, DeliveryState::Queued) {
            self.injecting.remove(&receipt.to);
            if let Some(handle) = self.agents.get_mut(&receipt.to) {
                if handle.active_injection.as_deref() == Some(receipt.delivery_id.as_str()) {
                    handle.active_injection = None;
                }
            }
            self.registry.refresh_activity_state(&receipt.to, false, now);
        }
        if receipt.state.is_terminal() {
            if matches!(&receipt.state, DeliveryState::Failed { .. }) {
                self.registry.record_failure(&receipt.to, "delivery_failed");
            } else {
                self.registry.record_success(&receipt.to);
            }
        }
        let _ = now;

        let event_name = match &receipt.state {
            DeliveryState::Queued => "delivery_queued",
            DeliveryState::Injected => "delivery_injected",
            DeliveryState::Verified => "delivery_verified",
            DeliveryState::Active { .. } => "delivery_active",
            DeliveryState::Acked => "delivery_acked",
            DeliveryState::Failed { .. } => "delivery_failed",
        };
        let payload = serde_json::to_value(receipt).unwrap_or_else(|_| json!({}));
        self.emit(event_name, payload, None).await;
    }

    async fn emit(&self, kind: &str, payload: Value, request_id: Option<String>) {
        emit_frame(&self.out_tx, kind, payload, request_id).await;
    }

    fn flush_snapshot(&mut self, now: Instant) {
        let recorded_at_ms = current_time_ms();
        let agents: Vec<AgentSnapshot> = self
            .registry
            .list()
            .map(|a| {
                let connected_at_ms = recorded_at_ms - now.duration_since(a.connected_at).as_millis() as i64;
                AgentSnapshot::from_agent(a, connected_at_ms)
            })
            .collect();
        let snapshot = RegistrySnapshot { agents };
        if let Err(e) = crate::persistence::write_snapshot_atomic(&self.config.state_dir, &snapshot) {
            warn!(err = %e, "snapshot write failed, entering degraded persistence mode");
        } else {
            self.snapshot_debouncer.mark_flushed(now);
        }
    }

    async fn do_shutdown(&mut self) {
        info!("broker shutting down: releasing agents and draining queues");
        let names: Vec<String> = self.agents.keys().cloned().collect();
        for name in names {
            if let Some(mut handle) = self.agents.remove(&name) {
                if let Some(tx) = handle.release_tx.take() {
                    let _ = tx.send(None);
                }
                let _ = tokio::time::timeout(Duration::from_secs(3), &mut handle.pump).await;
            }
        }
        self.flush_snapshot(Instant::now());
        if let Err(e) = self.pending_log.compact(PENDING_LOG_RETENTION, current_time_ms()) {
            warn!(err = %e, "final pending log compaction failed");
        }
    }
}

/// A delivery reconstructed from the pending log at startup, ready to be
/// fed back into the scheduler and delivery engine.
struct RecoveredDelivery {
    delivery_id: String,
    message_id: String,
    from: String,
    to: String,
    body: Value,
    thread_id: Option<String>,
    priority: Priority,
    attempt: u32,
}

/// Collapse a replayed pending log to its surviving, non-terminal
/// deliveries. Mirrors [`PendingLog::compact`]'s own group-by-delivery-id,
/// keep-latest-outcome reduction, but restores state instead of just
/// deciding retention. Anything whose latest record shows it already
/// reached `injected` (or beyond) comes back as `queued` with `attempt`
/// bumped by one, since the in-flight write it was waiting on is gone.
fn reconstruct_pending_deliveries(records: Vec<PendingLogRecord>) -> Vec<RecoveredDelivery> {
    let mut enqueues: HashMap<String, PendingLogRecord> = HashMap::new();
    let mut latest: HashMap<String, PendingLogRecord> = HashMap::new();
    for record in records {
        let Some(id) = record.delivery_id().map(str::to_owned) else { continue };
        match &record {
            PendingLogRecord::Enqueue { .. } => {
                enqueues.insert(id, record);
            }
            _ => {
                latest.insert(id, record);
            }
        }
    }

    let mut out = Vec::new();
    for (id, enqueue) in enqueues {
        let outcome = latest.get(&id);
        if matches!(outcome, Some(PendingLogRecord::Ack { .. }) | Some(PendingLogRecord::Fail { .. })) {
            continue;
        }
        let attempt = if matches!(outcome, Some(PendingLogRecord::Transition { .. })) { 1 } else { 0 };
        if let PendingLogRecord::Enqueue { delivery_id, message_id, from, to, body, thread_id, priority, .. } = enqueue {
            out.push(RecoveredDelivery { delivery_id, message_id, from, to, body, thread_id, priority, attempt });
        }
    }
    out
}

async fn emit_frame(out_tx: &mpsc::Sender<Vec<u8>>, kind: &str, payload: Value, request_id: Option<String>) {
    let mut frame = Frame::new(kind, payload);
    if let Some(id) = request_id {
        frame = frame.with_request_id(id);
    }
    match frame.encode() {
        Ok(bytes) => {
            let _ = out_tx.send(bytes).await;
        }
        Err(e) => warn!(err = %e, "failed to encode outbound frame"),
    }
}

fn cloud_events_tx(events_tx: mpsc::Sender<CoreEvent>) -> mpsc::Sender<CloudEvent> {
    let (tx, mut rx) = mpsc::channel::<CloudEvent>(256);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if events_tx.send(CoreEvent::Cloud(event)).await.is_err() {
                break;
            }
        }
    });
    tx
}

/// Reads length-prefixed frames from stdin and turns them into
/// [`CoreEvent::Client`]/[`CoreEvent::ClientClosed`] events. Stops on EOF or
/// when `shutdown` fires.
fn spawn_stdin_reader(events_tx: mpsc::Sender<CoreEvent>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = stdin.read(&mut buf) => {
                    match result {
                        Ok(0) => break,
                        Ok(n) => {
                            reader.feed(&buf[..n]);
                            loop {
                                match reader.next_frame() {
                                    Ok(Some(frame)) => {
                                        match ClientRequest::from_frame(frame) {
                                            Ok(req) => {
                                                if events_tx.send(CoreEvent::Client(req)).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => warn!(err = %e, "malformed control frame"),
                                        }
                                    }
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(err = %e, "frame decode error on control channel");
                                        break;
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(err = %e, "control channel read error");
                            break;
                        }
                    }
                }
            }
        }
        let _ = events_tx.send(CoreEvent::ClientClosed).await;
    });
}

/// Drains encoded frames onto stdout. Returns its join handle so the caller
/// can wait for the last bytes to flush before the process exits.
fn spawn_stdout_writer(mut out_rx: mpsc::Receiver<Vec<u8>>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(bytes) = out_rx.recv().await {
            if stdout.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    })
}

/// Forwards one agent's `SupervisorEvent`s into the core's event queue,
/// holding the `PtySupervisor` itself (and therefore the only handle that
/// can call `release`) for the agent's entire lifetime.
fn spawn_agent_pump(
    name: String,
    mut supervisor: PtySupervisor,
    release_rx: oneshot::Receiver<Option<u64>>,
    events_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<Option<ExitStatus>> {
    tokio::spawn(async move {
        tokio::pin!(release_rx);
        loop {
            tokio::select! {
                event = supervisor.next_event() => {
                    match event {
                        Some(event) => {
                            let status = match &event {
                                SupervisorEvent::Exited(status) => Some(*status),
                                _ => None,
                            };
                            if events_tx.send(CoreEvent::AgentOutput { agent: name.clone(), event }).await.is_err() {
                                return status;
                            }
                            if status.is_some() {
                                return status;
                            }
                        }
                        None => return None,
                    }
                }
                grace_ms = &mut release_rx => {
                    let grace = grace_ms.ok().flatten().map(Duration::from_millis);
                    let status = supervisor.release_with_grace(grace).await;
                    let _ = events_tx.send(CoreEvent::AgentOutput { agent: name, event: SupervisorEvent::Exited(status) }).await;
                    return Some(status);
                }
            }
        }
    })
}

#[cfg(test)]
#[path = "core_tests.rs"]
mod tests;
