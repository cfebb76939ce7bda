// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed JSON frame codec for the control channel.
//!
//! Each message on the wire is a 4-byte big-endian length followed by a
//! UTF-8 JSON object. The codec is stateless per direction: a `FrameReader`
//! accumulates bytes across partial reads and yields complete frames as
//! they become available, the same `AsyncFd` + non-blocking-read shape used
//! by the PTY Supervisor (`pty::nbio`).

use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{BrokerError, ErrorKind};

/// Maximum encoded frame length, header excluded.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const LEN_PREFIX_BYTES: usize = 4;

/// A single control-channel frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub v: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub ts: i64,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Frame {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            v: 1,
            kind: kind.into(),
            id: uuid::Uuid::new_v4().to_string(),
            ts: now_ms(),
            payload,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Encode this frame as a length-prefixed byte buffer ready to write.
    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        let body = serde_json::to_vec(self)
            .map_err(|e| BrokerError::new(ErrorKind::Internal, format!("encode frame: {e}")))?;
        if body.len() > MAX_FRAME_LEN {
            return Err(BrokerError::new(
                ErrorKind::FrameTooLarge,
                format!("encoded frame is {} bytes, max is {MAX_FRAME_LEN}", body.len()),
            ));
        }
        let mut out = Vec::with_capacity(LEN_PREFIX_BYTES + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Incremental frame decoder. Feed it bytes as they arrive; call [`Self::next_frame`]
/// after each feed to drain any frames that have become complete.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Attempt to decode the next complete frame from buffered bytes.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A frame whose declared
    /// length exceeds [`MAX_FRAME_LEN`] is rejected with `frame_too_large`;
    /// the reader discards the buffered length prefix so the connection can
    /// be closed by the caller without looping on the same oversized frame.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, BrokerError> {
        if self.buf.len() < LEN_PREFIX_BYTES {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[..LEN_PREFIX_BYTES].try_into().map_err(|_| {
            BrokerError::new(ErrorKind::Internal, "length prefix slice conversion failed")
        })?) as usize;

        if len > MAX_FRAME_LEN {
            self.buf.advance(LEN_PREFIX_BYTES);
            return Err(BrokerError::new(
                ErrorKind::FrameTooLarge,
                format!("frame declares {len} bytes, max is {MAX_FRAME_LEN}"),
            ));
        }

        if self.buf.len() < LEN_PREFIX_BYTES + len {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX_BYTES);
        let body = self.buf.split_to(len);
        let frame: Frame = serde_json::from_slice(&body)
            .map_err(|e| BrokerError::new(ErrorKind::Internal, format!("decode frame: {e}")))?;
        Ok(Some(frame))
    }
}

#[cfg(test)]
#[path = "frame_tests.rs"]
mod tests;
