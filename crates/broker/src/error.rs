// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error taxonomy shared across the control channel, the delivery engine, and
/// the persistence layer. Each variant names a kind of failure, not a
/// transport status — callers map a kind to whatever their surface needs
/// (a `reason` string on a receipt, a log field, a process exit code).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FrameTooLarge,
    NameConflict,
    SpawnFailed,
    WriteBlocked,
    WriteFailed,
    EchoTimeout,
    AgentGone,
    Canceled,
    Shed,
    PublishFailed,
    LockHeld,
    IoError,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FrameTooLarge => "frame_too_large",
            Self::NameConflict => "name_conflict",
            Self::SpawnFailed => "spawn_failed",
            Self::WriteBlocked => "write_blocked",
            Self::WriteFailed => "write_failed",
            Self::EchoTimeout => "echo_timeout",
            Self::AgentGone => "agent_gone",
            Self::Canceled => "canceled",
            Self::Shed => "shed",
            Self::PublishFailed => "publish_failed",
            Self::LockHeld => "lock_held",
            Self::IoError => "io_error",
            Self::Internal => "internal",
        }
    }

    /// Errors in this class are recoverable per-delivery: retried internally
    /// with no client notification until the decision becomes terminal.
    pub fn is_retryable_delivery_error(&self) -> bool {
        matches!(self, Self::EchoTimeout | Self::PublishFailed)
    }

    /// Errors in this class are agent-level: they propagate as agent events
    /// and fail every queued delivery for that agent.
    pub fn is_agent_level(&self) -> bool {
        matches!(self, Self::SpawnFailed | Self::AgentGone)
    }

    /// Errors in this class are fatal at broker startup.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Self::LockHeld | Self::IoError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with a taxonomy kind plus a human-readable reason, the shape
/// carried on `delivery_failed` receipts and logged at component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerError {
    pub kind: ErrorKind,
    pub reason: String,
}

impl BrokerError {
    pub fn new(kind: ErrorKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into() }
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for BrokerError {}

impl From<std::io::Error> for BrokerError {
    fn from(e: std::io::Error) -> Self {
        Self::new(ErrorKind::IoError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
