// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use clap::Parser;
use tempfile::TempDir;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::cloud::{CloudEvent, EchoEvent};
use crate::delivery::Certainty;
use crate::event::{ReleaseRequest, SendMessageRequest, SetSubscriptionRequest};
use crate::pty::{Backend, BackendInput, Boxed, ExitStatus};
use crate::registry::Agent;

/// Fake backend that echoes every write straight back out, the same
/// `Backend` seam the end-to-end scenario tests drive instead of a real PTY.
struct EchoBackend {
    pid: i32,
}

impl Backend for EchoBackend {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        Box::pin(async move {
            loop {
                tokio::select! {
                    input = input_rx.recv() => {
                        match input {
                            Some(BackendInput::Write(data)) => {
                                let _ = output_tx.send(data).await;
                            }
                            Some(BackendInput::Drain(ack)) => {
                                let _ = ack.send(());
                            }
                            None => break,
                        }
                    }
                    _ = resize_rx.recv() => {}
                }
            }
            Ok(ExitStatus { code: Some(0), signal: None })
        })
    }

    fn child_pid(&self) -> i32 {
        self.pid
    }

    fn pgid(&self) -> i32 {
        self.pid
    }
}

fn test_config(dir: &TempDir) -> BrokerConfig {
    let mut config = BrokerConfig::parse_from(["agent-broker"]);
    config.state_dir = dir.path().to_path_buf();
    config.write_timeout_ms = 200;
    config.max_queue_depth = 1;
    config
}

async fn test_core(dir: &TempDir) -> BrokerCore {
    let config = test_config(dir);
    let (core, _writer_task) = BrokerCore::start(config, CancellationToken::new()).await.expect("start core");
    core
}

/// Registers `name` in both the registry and the core's agent-handle table,
/// backed by an [`EchoBackend`], without going through `handle_spawn`.
fn spawn_echo_agent(core: &mut BrokerCore, name: &str, runtime: &str) {
    let backend = EchoBackend { pid: 42 };
    let supervisor = PtySupervisor::spawn_with_backend(name.to_owned(), backend.boxed(), 65_536, Duration::from_millis(200));
    let writer = supervisor.writer();
    let (release_tx, release_rx) = oneshot::channel();
    let pump = spawn_agent_pump(name.to_owned(), supervisor, release_rx, core.events_tx.clone());

    let mut agent = Agent::new(name, runtime, vec![runtime.to_owned()], PathBuf::from("."), 42, 42);
    agent.state = AgentState::Ready;
    core.registry.register(agent).expect("register agent");
    core.agents.insert(
        name.to_owned(),
        AgentHandle { writer, release_tx: Some(release_tx), pump, scan_window: Vec::new(), active_injection: None },
    );
}

#[tokio::test]
async fn send_message_with_no_local_targets_still_publishes() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;

    let reply = core
        .handle_send_message(SendMessageRequest {
            to: "nobody".to_owned(),
            text: "hello".to_owned(),
            from: "orchestrator".to_owned(),
            thread_id: None,
            priority: None,
        })
        .await;

    assert_eq!(reply["local_targets"], serde_json::json!([]));
    assert_eq!(reply["published"], serde_json::json!(true));
}

#[tokio::test]
async fn send_message_fans_out_to_channel_subscribers() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    spawn_echo_agent(&mut core, "bob", "claude");
    core.registry.set_subscription("alice", vec!["ops".to_owned()]).expect("subscribe alice");
    core.registry.set_subscription("bob", vec!["ops".to_owned()]).expect("subscribe bob");

    let reply = core
        .handle_send_message(SendMessageRequest {
            to: "#ops".to_owned(),
            text: "deploy now".to_owned(),
            from: "orchestrator".to_owned(),
            thread_id: None,
            priority: None,
        })
        .await;

    let targets = reply["local_targets"].as_array().expect("targets array");
    assert_eq!(targets.len(), 2);
    assert_eq!(core.scheduler.depth("alice"), 1);
    assert_eq!(core.scheduler.depth("bob"), 1);
}

#[tokio::test]
async fn set_subscription_updates_channel_membership() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");

    let reply = core.handle_set_subscription(SetSubscriptionRequest { name: "alice".to_owned(), channels: vec!["ops".to_owned()] });
    assert_eq!(reply["ok"], serde_json::json!(true));
    assert_eq!(core.registry.resolve_targets("#ops"), vec!["alice".to_owned()]);
}

#[tokio::test]
async fn list_agents_reports_queue_depth() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    core.scheduler.enqueue("alice", Priority::P2, "pending-1".to_owned());

    let list = core.handle_list_agents();
    let entries = list.as_array().expect("agent list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["name"], serde_json::json!("alice"));
    assert_eq!(entries[0]["queue_depth"], serde_json::json!(1));
}

#[tokio::test]
async fn get_metrics_reports_state_counts_and_backlog() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    core.deliveries.enqueue("m1".to_owned(), "orchestrator".to_owned(), "alice".to_owned(), serde_json::json!({"text": "hi"}), None, Priority::P2);

    let metrics = core.handle_get_metrics();
    assert_eq!(metrics["agents"], serde_json::json!(1));
    assert_eq!(metrics["deliveries"]["queued"], serde_json::json!(1));
    assert_eq!(metrics["publish_backlog"], serde_json::json!(0));
}

#[tokio::test]
async fn on_tick_injects_the_highest_priority_delivery_first() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");

    let low = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "low"}), None, Priority::P3);
    let urgent = core.deliveries.enqueue("m2".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "urgent"}), None, Priority::P0);
    core.scheduler.enqueue("alice", Priority::P3, low.clone());
    core.scheduler.enqueue("alice", Priority::P0, urgent.clone());

    core.on_tick().await;

    assert_eq!(core.deliveries.get(&urgent).expect("urgent present").state, DeliveryState::Injected);
    assert_eq!(core.deliveries.get(&low).expect("low present").state, DeliveryState::Queued);
}

#[tokio::test]
async fn scanner_observes_echo_then_activity_marker() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    let now = Instant::now();

    let delivery_id = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "run the tests"}), None, Priority::P2);
    core.deliveries.mark_injected(&delivery_id, now);
    if let Some(handle) = core.agents.get_mut("alice") {
        handle.active_injection = Some(delivery_id.clone());
        handle.scan_window = b"run the tests".to_vec();
    }
    core.injecting.insert("alice".to_owned());
    core.registry.refresh_activity_state("alice", true, now);

    core.run_scanner("alice", now).await;
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").state, DeliveryState::Verified);
    assert_eq!(core.registry.lookup("alice").expect("present").state, AgentState::Active);

    if let Some(handle) = core.agents.get_mut("alice") {
        handle.scan_window.extend_from_slice(b" Running tool_use now");
    }
    core.run_scanner("alice", now).await;

    assert_eq!(
        core.deliveries.get(&delivery_id).expect("present").state,
        DeliveryState::Active { certainty: Certainty::High }
    );
    assert!(core.agents.get("alice").expect("agent present").active_injection.is_none());
    assert!(!core.injecting.contains("alice"));
    assert_eq!(
        core.registry.lookup("alice").expect("present").state,
        AgentState::Ready,
        "the scan-activity success path must demote the agent out of active immediately, not wait for the next tick sweep"
    );
}

#[tokio::test]
async fn cloud_echo_replay_of_an_already_published_message_is_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "bob", "claude");

    let reply = core
        .handle_send_message(SendMessageRequest {
            to: "bob".to_owned(),
            text: "ping".to_owned(),
            from: "alice".to_owned(),
            thread_id: None,
            priority: None,
        })
        .await;
    let message_id = reply["message_id"].as_str().expect("message id").to_owned();
    assert_eq!(core.scheduler.depth("bob"), 1);

    core.handle_cloud_event(CloudEvent::EchoReceived(EchoEvent {
        event_id: message_id,
        channel: "bob".to_owned(),
        from: "alice".to_owned(),
        text: "ping".to_owned(),
        ts: 0,
    }))
    .await;

    assert_eq!(core.scheduler.depth("bob"), 1, "the replayed echo of our own publish must not create a second delivery");
}

#[tokio::test]
async fn cloud_echo_of_an_unseen_event_id_enters_the_local_delivery_pipeline() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "bob", "claude");
    core.registry.set_subscription("bob", vec!["ops".to_owned()]).expect("subscribe bob");

    core.handle_cloud_event(CloudEvent::EchoReceived(EchoEvent {
        event_id: "remote-event-1".to_owned(),
        channel: "#ops".to_owned(),
        from: "carol".to_owned(),
        text: "status?".to_owned(),
        ts: 0,
    }))
    .await;

    assert_eq!(core.scheduler.depth("bob"), 1);
    assert_eq!(core.dedup.len(), 1);
}

#[tokio::test]
async fn publish_abandoned_is_dead_lettered_to_persistence() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;

    core.handle_cloud_event(CloudEvent::PublishAbandoned {
        message_id: "m1".to_owned(),
        channel: "#ops".to_owned(),
        reason: "publish_failed: timeout".to_owned(),
    })
    .await;

    let records = core.pending_log.replay().expect("replay pending log");
    assert!(
        records.iter().any(|r| matches!(
            r,
            PendingLogRecord::Abandoned { message_id, channel, reason, .. }
                if message_id == "m1" && channel == "#ops" && reason == "publish_failed: timeout"
        )),
        "an abandoned publish must be dead-lettered to the pending log"
    );
}

#[tokio::test]
async fn echo_timeout_retries_with_backoff_and_frees_the_agent_for_reinjection() {
    let dir = TempDir::new().expect("tempdir");
    let mut config = test_config(&dir);
    config.echo_window_ms = 20;
    config.retry_backoff_ms = vec![10, 40, 160];
    let (mut core, _writer_task) = BrokerCore::start(config, CancellationToken::new()).await.expect("start core");
    spawn_echo_agent(&mut core, "bob", "claude");

    let delivery_id = core.deliveries.enqueue("m1".to_owned(), "alice".to_owned(), "bob".to_owned(), serde_json::json!({"text": "ping"}), None, Priority::P2);
    core.scheduler.enqueue("bob", Priority::P2, delivery_id.clone());

    core.on_tick().await;
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").state, DeliveryState::Injected);

    // Let the echo window lapse with no echo observed: this should demote the
    // delivery back to `queued` with a backoff, and must free `bob` up again
    // rather than leaving it stuck in `injecting` forever.
    tokio::time::sleep(Duration::from_millis(30)).await;
    core.on_tick().await;
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").state, DeliveryState::Queued);
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").attempt, 1);
    assert!(!core.injecting.contains("bob"), "a timed-out delivery must not keep its agent marked in-flight forever");

    tokio::time::sleep(Duration::from_millis(15)).await;
    core.on_tick().await;
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").state, DeliveryState::Injected, "the retry should have been re-injected");
    // A second PTY write has now gone out, so `attempt` advances to 2 — it
    // counts injections made, not timeouts experienced.
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").attempt, 2);

    let now = Instant::now();
    if let Some(handle) = core.agents.get_mut("bob") {
        handle.active_injection = Some(delivery_id.clone());
        handle.scan_window = b"ping".to_vec();
    }
    core.run_scanner("bob", now).await;
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").state, DeliveryState::Verified);
    assert_eq!(core.deliveries.get(&delivery_id).expect("present").attempt, 2, "attempt_count=2 on the terminal receipt after one retry");
}

#[tokio::test]
async fn deliveries_pending_at_a_prior_crash_are_restored_to_queued_on_restart() {
    let dir = TempDir::new().expect("tempdir");
    let state_dir = dir.path().to_path_buf();
    let log = PendingLog::new(&state_dir);

    // Three deliveries that had already been written to Bob's pty before the
    // crash: each gets an Enqueue plus a later Transition record.
    let injected_ids: Vec<String> = (0..3).map(|i| format!("injected-{i}")).collect();
    for id in &injected_ids {
        log.append(&PendingLogRecord::Enqueue {
            delivery_id: id.clone(),
            message_id: format!("msg-{id}"),
            from: "alice".to_owned(),
            to: "bob".to_owned(),
            body: serde_json::json!({"text": "ping"}),
            thread_id: None,
            priority: Priority::P2,
            recorded_at_ms: current_time_ms(),
        })
        .expect("append enqueue");
        log.append(&PendingLogRecord::Transition { delivery_id: id.clone(), state: DeliveryState::Injected, recorded_at_ms: current_time_ms() })
            .expect("append transition");
    }

    // Two deliveries that never got past the queue.
    let queued_ids: Vec<String> = (0..2).map(|i| format!("queued-{i}")).collect();
    for id in &queued_ids {
        log.append(&PendingLogRecord::Enqueue {
            delivery_id: id.clone(),
            message_id: format!("msg-{id}"),
            from: "alice".to_owned(),
            to: "bob".to_owned(),
            body: serde_json::json!({"text": "ping"}),
            thread_id: None,
            priority: Priority::P2,
            recorded_at_ms: current_time_ms(),
        })
        .expect("append enqueue");
    }

    // One delivery that reached a terminal state before the crash: it must
    // not come back at all.
    log.append(&PendingLogRecord::Enqueue {
        delivery_id: "acked-0".to_owned(),
        message_id: "msg-acked-0".to_owned(),
        from: "alice".to_owned(),
        to: "bob".to_owned(),
        body: serde_json::json!({"text": "ping"}),
        thread_id: None,
        priority: Priority::P2,
        recorded_at_ms: current_time_ms(),
    })
    .expect("append enqueue");
    log.append(&PendingLogRecord::Ack { delivery_id: "acked-0".to_owned(), recorded_at_ms: current_time_ms() }).expect("append ack");

    let mut config = test_config(&dir);
    config.max_queue_depth = 10;
    let (core, _writer_task) = BrokerCore::start(config, CancellationToken::new()).await.expect("restart core");

    assert_eq!(core.scheduler.depth("bob"), 5, "no duplicate ids, and the acked delivery must not reappear");
    for id in &injected_ids {
        let delivery = core.deliveries.get(id).expect("restored");
        assert_eq!(delivery.state, DeliveryState::Queued, "a crash mid-injection restarts from queued, not injected");
        assert_eq!(delivery.attempt, 1);
    }
    for id in &queued_ids {
        let delivery = core.deliveries.get(id).expect("restored");
        assert_eq!(delivery.state, DeliveryState::Queued);
        assert_eq!(delivery.attempt, 0);
    }
    assert!(core.deliveries.get("acked-0").is_none());
}

#[tokio::test]
async fn agent_exit_fails_its_queued_and_in_flight_deliveries() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    let now = Instant::now();

    let queued = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "a"}), None, Priority::P2);
    core.scheduler.enqueue("alice", Priority::P2, queued.clone());
    let injected = core.deliveries.enqueue("m2".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "b"}), None, Priority::P2);
    core.deliveries.mark_injected(&injected, now);

    core.handle_agent_output("alice".to_owned(), SupervisorEvent::Exited(ExitStatus { code: Some(1), signal: None })).await;

    assert_eq!(core.deliveries.get(&queued).expect("present").state, DeliveryState::Failed { reason: "agent_gone".to_owned() });
    assert_eq!(core.deliveries.get(&injected).expect("present").state, DeliveryState::Failed { reason: "agent_gone".to_owned() });
    assert_eq!(core.registry.lookup("alice").expect("still present, gone").state, AgentState::Gone);
    assert!(!core.agents.contains_key("alice"));
}

/// Backend that only exits once `released` flips, independent of whatever
/// signal the release ladder sends it — the same seam `FakeBackend` in the
/// supervisor tests drives, reused here to exercise `handle_release` without
/// a real child process.
struct StallingBackend {
    pid: i32,
    released: Arc<AtomicBool>,
}

impl Backend for StallingBackend {
    fn run(
        &mut self,
        _output_tx: mpsc::Sender<Bytes>,
        mut input_rx: mpsc::Receiver<BackendInput>,
        mut resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn std::future::Future<Output = anyhow::Result<ExitStatus>> + Send + '_>> {
        let released = self.released.clone();
        Box::pin(async move {
            loop {
                if released.load(Ordering::SeqCst) {
                    break;
                }
                tokio::select! {
                    input = input_rx.recv() => {
                        if input.is_none() {
                            break;
                        }
                    }
                    _ = resize_rx.recv() => {}
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
            }
            Ok(ExitStatus { code: Some(0), signal: None })
        })
    }

    fn child_pid(&self) -> i32 {
        self.pid
    }

    fn pgid(&self) -> i32 {
        self.pid
    }
}

fn spawn_stalling_agent(core: &mut BrokerCore, name: &str, released: Arc<AtomicBool>) {
    let backend = StallingBackend { pid: 43, released };
    let supervisor = PtySupervisor::spawn_with_backend(name.to_owned(), backend.boxed(), 65_536, Duration::from_millis(200));
    let writer = supervisor.writer();
    let (release_tx, release_rx) = oneshot::channel();
    let pump = spawn_agent_pump(name.to_owned(), supervisor, release_rx, core.events_tx.clone());

    let mut agent = Agent::new(name, "claude", vec!["claude".to_owned()], PathBuf::from("."), 43, 43);
    agent.state = AgentState::Ready;
    core.registry.register(agent).expect("register agent");
    core.agents.insert(
        name.to_owned(),
        AgentHandle { writer, release_tx: Some(release_tx), pump, scan_window: Vec::new(), active_injection: None },
    );
}

#[tokio::test]
async fn release_waits_for_exit_and_reports_the_real_exit_code() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    let released = Arc::new(AtomicBool::new(false));
    spawn_stalling_agent(&mut core, "alice", released.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        released.store(true, Ordering::SeqCst);
    });

    let response = core.handle_release(ReleaseRequest { name: "alice".to_owned(), grace_ms: None }).await;
    assert_eq!(response["ok"], serde_json::json!(true));
    assert_eq!(response["exit_code"], serde_json::json!(0));
    assert!(!core.agents.contains_key("alice"));
}

#[tokio::test]
async fn release_grace_ms_overrides_the_default_ladder_wait() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    let released = Arc::new(AtomicBool::new(false));
    spawn_stalling_agent(&mut core, "alice", released.clone());

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        released.store(true, Ordering::SeqCst);
    });

    let start = Instant::now();
    let response = core.handle_release(ReleaseRequest { name: "alice".to_owned(), grace_ms: Some(5) }).await;
    assert_eq!(response["ok"], serde_json::json!(true));
    assert!(
        start.elapsed() < Duration::from_secs(1),
        "a 5ms grace override should not wait out the default multi-second ladder"
    );
}

#[tokio::test]
async fn agent_state_reflects_in_flight_delivery_then_returns_to_ready() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    core.registry.mark_idle("alice");
    assert_eq!(core.registry.lookup("alice").expect("present").state, AgentState::Ready);

    let now = Instant::now();
    let delivery_id = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "ping"}), None, Priority::P2);
    core.inject("alice".to_owned(), delivery_id.clone(), now).await;
    assert_eq!(core.registry.lookup("alice").expect("present").state, AgentState::Active);
    assert!(core.injecting.contains("alice"));

    let receipt = core.fail_delivery(&delivery_id, "test_done").expect("fail transitions");
    core.on_delivery_transition(&receipt, now).await;

    assert_eq!(core.registry.lookup("alice").expect("present").state, AgentState::Ready);
    assert!(!core.injecting.contains("alice"));
}

#[tokio::test]
async fn agent_state_reports_busy_over_active_once_backpressured() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    core.registry.mark_idle("alice");

    let now = Instant::now();
    core.registry.mark_output("alice", now, 10_000_000);
    let delivery_id = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "ping"}), None, Priority::P2);
    core.inject("alice".to_owned(), delivery_id.clone(), now).await;

    assert_eq!(core.registry.lookup("alice").expect("present").state, AgentState::Busy);
}

#[tokio::test]
async fn shedding_drops_the_newest_low_priority_entry_once_backpressured() {
    let dir = TempDir::new().expect("tempdir");
    let mut core = test_core(&dir).await;
    spawn_echo_agent(&mut core, "alice", "claude");
    let now = Instant::now();
    core.registry.mark_output("alice", now, 10_000);
    assert!(core.registry.lookup("alice").expect("agent present").is_backpressured(now));

    let older = core.deliveries.enqueue("m1".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "low-1"}), None, Priority::P4);
    let newer = core.deliveries.enqueue("m2".to_owned(), "x".to_owned(), "alice".to_owned(), serde_json::json!({"text": "low-2"}), None, Priority::P4);
    core.scheduler.enqueue("alice", Priority::P4, older.clone());
    core.scheduler.enqueue("alice", Priority::P4, newer.clone());

    core.on_tick().await;

    assert_eq!(core.deliveries.get(&newer).expect("present").state, DeliveryState::Failed { reason: "shed".to_owned() });
    assert_eq!(core.deliveries.get(&older).expect("present").state, DeliveryState::Queued);
}
