// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-channel request parsing and the single event type the Broker
//! Core's select loop dispatches on.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

use crate::cloud::CloudEvent;
use crate::delivery::Priority;
use crate::error::{BrokerError, ErrorKind};
use crate::frame::Frame;
use crate::pty::SupervisorEvent;

#[derive(Debug, Clone, Deserialize)]
pub struct SpawnRequest {
    pub name: String,
    pub runtime: String,
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseRequest {
    pub name: String,
    pub grace_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    pub to: String,
    pub text: String,
    pub from: String,
    pub thread_id: Option<String>,
    pub priority: Option<Priority>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetSubscriptionRequest {
    pub name: String,
    pub channels: Vec<String>,
}

/// A parsed control-channel request, per the broker's external request
/// surface.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Spawn(SpawnRequest),
    Release(ReleaseRequest),
    SendMessage(SendMessageRequest),
    SetSubscription(SetSubscriptionRequest),
    ListAgents,
    GetMetrics,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub request_id: Option<String>,
    pub kind: RequestKind,
}

impl ClientRequest {
    /// Parse a decoded [`Frame`] into a typed request. `request_id`, if the
    /// client set one, is what the reply frame echoes back; it is distinct
    /// from the frame's own `id`.
    pub fn from_frame(frame: Frame) -> Result<Self, BrokerError> {
        let kind = match frame.kind.as_str() {
            "spawn" => RequestKind::Spawn(parse_payload(frame.payload)?),
            "release" => RequestKind::Release(parse_payload(frame.payload)?),
            "send_message" => RequestKind::SendMessage(parse_payload(frame.payload)?),
            "set_subscription" => RequestKind::SetSubscription(parse_payload(frame.payload)?),
            "list_agents" => RequestKind::ListAgents,
            "get_metrics" => RequestKind::GetMetrics,
            "shutdown" => RequestKind::Shutdown,
            other => return Err(BrokerError::new(ErrorKind::Internal, format!("unknown request type '{other}'"))),
        };
        Ok(Self { request_id: frame.request_id, kind })
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, BrokerError> {
    serde_json::from_value(payload).map_err(|e| BrokerError::new(ErrorKind::Internal, format!("invalid request payload: {e}")))
}

/// Everything the Broker Core's single select loop can wake up for. I/O
/// tasks never touch core state directly; they only ever produce one of
/// these and hand it into the core's event queue.
#[derive(Debug)]
pub enum CoreEvent {
    Client(ClientRequest),
    ClientClosed,
    AgentOutput { agent: String, event: SupervisorEvent },
    Cloud(CloudEvent),
    SchedulerTick,
}

#[cfg(test)]
#[path = "event_tests.rs"]
mod tests;
