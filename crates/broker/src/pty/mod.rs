// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

pub mod nbio;
pub mod spawn;
pub mod supervisor;

pub use supervisor::{PtySupervisor, PtyWriter, SupervisorEvent};

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Input sent to the PTY backend: either raw bytes to write or a drain
/// synchronization point.
#[derive(Debug)]
pub enum BackendInput {
    /// Raw bytes to write to the PTY master.
    Write(Bytes),
    /// Drain marker: since the backend processes messages sequentially, all
    /// prior writes have completed by the time this is received. The
    /// sender is notified via the oneshot channel — this is how
    /// [`supervisor::PtySupervisor::write`] implements the write-with-timeout
    /// contract from the PTY Supervisor design.
    Drain(tokio::sync::oneshot::Sender<()>),
}

/// How a child process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Terminal backend abstraction over a real PTY or a test double.
///
/// Object-safe for use as `Box<dyn Backend>`, which is the seam the
/// end-to-end scenario tests (S1-S6) drive instead of spawning real child
/// processes.
pub trait Backend: Send + 'static {
    fn run(
        &mut self,
        output_tx: mpsc::Sender<Bytes>,
        input_rx: mpsc::Receiver<BackendInput>,
        resize_rx: mpsc::Receiver<(u16, u16)>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<ExitStatus>> + Send + '_>>;

    /// PID of the child process.
    fn child_pid(&self) -> i32;

    /// Process group ID that owns the child. Release signals this group,
    /// not just the child PID, so a runtime that forks helper processes is
    /// torn down along with it.
    fn pgid(&self) -> i32;
}

/// Conversion trait so both concrete backends and `Box<dyn Backend>` can be
/// passed to [`supervisor::PtySupervisor::spawn_with_backend`] without
/// explicit boxing.
pub trait Boxed {
    fn boxed(self) -> Box<dyn Backend>;
}

impl<T: Backend> Boxed for T {
    fn boxed(self) -> Box<dyn Backend> {
        Box::new(self)
    }
}

impl Boxed for Box<dyn Backend> {
    fn boxed(self) -> Box<dyn Backend> {
        self
    }
}
