use serde_json::json;

use super::*;

fn frame(kind: &str, payload: Value) -> Frame {
    Frame::new(kind, payload).with_request_id("req-1")
}

#[test]
fn spawn_request_parses() {
    let f = frame(
        "spawn",
        json!({"name": "alice", "runtime": "claude", "argv": ["claude"], "cwd": "/tmp"}),
    );
    let req = ClientRequest::from_frame(f).expect("parse spawn");
    assert_eq!(req.request_id.as_deref(), Some("req-1"));
    match req.kind {
        RequestKind::Spawn(spawn) => {
            assert_eq!(spawn.name, "alice");
            assert_eq!(spawn.runtime, "claude");
            assert!(spawn.env.is_empty());
            assert!(spawn.channels.is_empty());
        }
        other => panic!("expected Spawn, got {other:?}"),
    }
}

#[test]
fn release_request_parses_optional_grace() {
    let f = frame("release", json!({"name": "alice"}));
    let req = ClientRequest::from_frame(f).expect("parse release");
    match req.kind {
        RequestKind::Release(release) => {
            assert_eq!(release.name, "alice");
            assert!(release.grace_ms.is_none());
        }
        other => panic!("expected Release, got {other:?}"),
    }
}

#[test]
fn send_message_request_parses() {
    let f = frame(
        "send_message",
        json!({"to": "bob", "text": "hi", "from": "alice", "priority": "p1"}),
    );
    let req = ClientRequest::from_frame(f).expect("parse send_message");
    match req.kind {
        RequestKind::SendMessage(send) => {
            assert_eq!(send.to, "bob");
            assert_eq!(send.text, "hi");
            assert_eq!(send.priority, Some(Priority::P1));
            assert!(send.thread_id.is_none());
        }
        other => panic!("expected SendMessage, got {other:?}"),
    }
}

#[test]
fn set_subscription_request_parses() {
    let f = frame("set_subscription", json!({"name": "alice", "channels": ["general", "ops"]}));
    let req = ClientRequest::from_frame(f).expect("parse set_subscription");
    match req.kind {
        RequestKind::SetSubscription(sub) => {
            assert_eq!(sub.name, "alice");
            assert_eq!(sub.channels, vec!["general".to_owned(), "ops".to_owned()]);
        }
        other => panic!("expected SetSubscription, got {other:?}"),
    }
}

#[test]
fn parameterless_requests_ignore_payload_shape() {
    for kind in ["list_agents", "get_metrics", "shutdown"] {
        let f = frame(kind, json!({}));
        let req = ClientRequest::from_frame(f).unwrap_or_else(|_| panic!("parse {kind}"));
        match (kind, req.kind) {
            ("list_agents", RequestKind::ListAgents) => {}
            ("get_metrics", RequestKind::GetMetrics) => {}
            ("shutdown", RequestKind::Shutdown) => {}
            (kind, other) => panic!("unexpected parse for {kind}: {other:?}"),
        }
    }
}

#[test]
fn unknown_request_type_is_rejected() {
    let f = frame("teleport", json!({}));
    let err = ClientRequest::from_frame(f).expect_err("unknown type should fail");
    assert_eq!(err.kind, ErrorKind::Internal);
}

#[test]
fn malformed_payload_is_rejected() {
    let f = frame("spawn", json!({"name": "alice"}));
    let err = ClientRequest::from_frame(f).expect_err("missing required fields should fail");
    assert_eq!(err.kind, ErrorKind::Internal);
}
