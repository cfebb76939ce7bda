// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-agent PTY supervisor: owns the running backend task, the output ring
//! buffer, and the process-group release ladder.

use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{info, trace, warn};

use crate::error::{BrokerError, ErrorKind};
use crate::ring::RingBuffer;

use super::{Backend, BackendInput, ExitStatus};

const RELEASE_SIGHUP_GRACE: Duration = Duration::from_secs(2);
const RELEASE_SIGTERM_GRACE: Duration = Duration::from_secs(1);

/// Emitted by a supervisor as the child produces output or terminates.
#[derive(Debug)]
pub enum SupervisorEvent {
    /// New bytes landed in the ring buffer; `offset` is the byte offset of
    /// the first byte in `data` within the global ring buffer stream.
    Output { offset: u64, data: Bytes },
    /// The ring buffer overflowed and silently discarded the oldest bytes.
    OutputTruncated { dropped: usize },
    /// The child exited; the backend has already been reaped.
    Exited(ExitStatus),
}

/// Owns a single agent's PTY backend and its output ring buffer.
///
/// The supervisor is driven entirely by the agent it was built for; it is
/// not `Clone` and holds no state shared with any other agent.
pub struct PtySupervisor {
    name: String,
    pid: i32,
    pgid: i32,
    write_timeout: Duration,
    input_tx: mpsc::Sender<BackendInput>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    /// The backend's own run loop, which owns the single `waitpid` call for
    /// this child (see `NativePty::run`). `release` joins this instead of
    /// reaping independently, so a child is never waited on from two
    /// places at once.
    run_task: JoinHandle<ExitStatus>,
}

impl PtySupervisor {
    /// Start supervising `backend`, which is assumed to already be spawned
    /// (its child process running). Spawns the backend's async run loop as
    /// a background task and begins funneling its output into a ring
    /// buffer of `ring_capacity` bytes.
    pub fn spawn_with_backend(
        name: impl Into<String>,
        mut backend: Box<dyn Backend>,
        ring_capacity: usize,
        write_timeout: Duration,
    ) -> Self {
        let name = name.into();
        let pid = backend.child_pid();
        let pgid = backend.pgid();

        let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(256);
        let (input_tx, input_rx) = mpsc::channel::<BackendInput>(64);
        let (resize_tx, resize_rx) = mpsc::channel::<(u16, u16)>(4);
        let (events_tx, events_rx) = mpsc::channel::<SupervisorEvent>(256);

        let agent_name = name.clone();
        let run_task = tokio::spawn(async move {
            let backend_fut = backend.run(output_tx, input_rx, resize_rx);
            tokio::pin!(backend_fut);

            let mut ring = RingBuffer::new(ring_capacity);
            loop {
                tokio::select! {
                    chunk = output_rx.recv() => {
                        match chunk {
                            Some(data) => {
                                trace!(agent = %agent_name, bytes = data.len(), "pty output");
                                let before = ring.total_written();
                                ring.write(&data);
                                let after = ring.total_written();
                                let capacity = ring_capacity as u64;
                                // Bytes in this chunk that fell outside the ring's
                                // addressable window once the buffer has wrapped.
                                let overwritten = after.saturating_sub(capacity) - before.saturating_sub(capacity);
                                if overwritten > 0 {
                                    let _ = events_tx
                                        .send(SupervisorEvent::OutputTruncated { dropped: overwritten as usize })
                                        .await;
                                }
                                let offset = after - data.len() as u64;
                                let _ = events_tx.send(SupervisorEvent::Output { offset, data }).await;
                            }
                            None => {}
                        }
                    }
                    status = &mut backend_fut => {
                        let status = status.unwrap_or(ExitStatus { code: None, signal: None });
                        info!(agent = %agent_name, ?status, "pty backend exited");
                        let _ = events_tx.send(SupervisorEvent::Exited(status)).await;
                        break status;
                    }
                }
            }
        });

        Self {
            name,
            pid,
            pgid,
            write_timeout,
            input_tx,
            resize_tx,
            events_rx,
            run_task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    /// Receive the next event from this agent's backend. Returns `None`
    /// once the backend task has exited and drained its event channel.
    pub async fn next_event(&mut self) -> Option<SupervisorEvent> {
        self.events_rx.recv().await
    }

    /// Write bytes to the PTY master, blocking up to `write_timeout`.
    /// Fails with `write_blocked` on timeout, `write_failed` if the
    /// backend task has already gone away.
    pub async fn write(&self, data: Bytes) -> Result<(), BrokerError> {
        let send = self.input_tx.send(BackendInput::Write(data));
        tokio::time::timeout(self.write_timeout, send)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let drain = self.input_tx.send(BackendInput::Drain(ack_tx));
        tokio::time::timeout(self.write_timeout, drain)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;

        tokio::time::timeout(self.write_timeout, ack_rx)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BrokerError> {
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))
    }

    /// A cheap `Clone`-able handle for writing to and resizing this agent's
    /// PTY from the core, independent of the supervisor itself (which the
    /// per-agent output pump task owns and polls via `next_event`).
    pub fn writer(&self) -> PtyWriter {
        PtyWriter {
            input_tx: self.input_tx.clone(),
            resize_tx: self.resize_tx.clone(),
            write_timeout: self.write_timeout,
        }
    }

    /// Graceful release: SIGHUP to the process group, wait, SIGTERM, wait,
    /// SIGKILL. The backend's run loop observes the child's death, reaps
    /// it, and completes `run_task`; release polls that handle rather than
    /// waiting independently, so the child is never reaped twice.
    pub async fn release(self) -> ExitStatus {
        self.release_with_grace(None).await
    }

    /// Same ladder as [`PtySupervisor::release`], but `grace_override`, when
    /// set, replaces both the SIGHUP and the SIGTERM grace window instead of
    /// the hardcoded defaults — a caller that knows its agent shuts down
    /// quickly (or needs longer to flush) can ask for a different wait.
    pub async fn release_with_grace(self, grace_override: Option<Duration>) -> ExitStatus {
        let sighup_grace = grace_override.unwrap_or(RELEASE_SIGHUP_GRACE);
        let sigterm_grace = grace_override.unwrap_or(RELEASE_SIGTERM_GRACE);
        let pgid = Pid::from_raw(-self.pgid);
        let mut run_task = self.run_task;

        info!(agent = %self.name, pgid = self.pgid, "releasing agent process group");
        let _ = kill(pgid, Signal::SIGHUP);
        if wait_for_finish(&mut run_task, sighup_grace).await {
            return join_result(run_task).await;
        }

        warn!(agent = %self.name, pgid = self.pgid, "sighup grace elapsed, sending sigterm");
        let _ = kill(pgid, Signal::SIGTERM);
        if wait_for_finish(&mut run_task, sigterm_grace).await {
            return join_result(run_task).await;
        }

        warn!(agent = %self.name, pgid = self.pgid, "sigterm grace elapsed, sending sigkill");
        let _ = kill(pgid, Signal::SIGKILL);
        join_result(run_task).await
    }
}

/// Poll `run_task` for up to `grace` without consuming it, so a later tier
/// of the signal ladder can still join it.
async fn wait_for_finish(run_task: &mut JoinHandle<ExitStatus>, grace: Duration) -> bool {
    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if run_task.is_finished() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    run_task.is_finished()
}

async fn join_result(run_task: JoinHandle<ExitStatus>) -> ExitStatus {
    run_task.await.unwrap_or(ExitStatus { code: None, signal: None })
}

/// Detached write/resize handle for an agent's PTY. Holding one does not
/// keep the agent's output pump alive; it only lets the core push input
/// without owning the supervisor (and its `events_rx`) directly.
#[derive(Clone)]
pub struct PtyWriter {
    input_tx: mpsc::Sender<BackendInput>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    write_timeout: Duration,
}

impl PtyWriter {
    /// Write bytes to the PTY master, blocking up to the configured write
    /// timeout. Mirrors [`PtySupervisor::write`].
    pub async fn write(&self, data: Bytes) -> Result<(), BrokerError> {
        let send = self.input_tx.send(BackendInput::Write(data));
        tokio::time::timeout(self.write_timeout, send)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let drain = self.input_tx.send(BackendInput::Drain(ack_tx));
        tokio::time::timeout(self.write_timeout, drain)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;

        tokio::time::timeout(self.write_timeout, ack_rx)
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteBlocked, "pty write exceeded timeout"))?
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))?;
        Ok(())
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), BrokerError> {
        self.resize_tx
            .send((cols, rows))
            .await
            .map_err(|_| BrokerError::new(ErrorKind::WriteFailed, "pty backend channel closed"))
    }
}

/// Persisted handle used to attempt reattachment across a broker restart.
/// §4.3 Attach/Reattach: the supervisor never adopts a stale pid — if the
/// master side can't be reacquired the agent is treated as `gone`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AttachHandle {
    pub pid: i32,
    pub pgid: i32,
    pub cwd: PathBuf,
}

/// Attempt to confirm a previously-persisted agent is still alive. Real
/// reattachment to the PTY master fd is not possible once the owning
/// process has exited (the fd table does not survive), so this only ever
/// confirms liveness via `kill(pid, 0)`; a live process with a dead master
/// fd is still reported as `gone` by the caller, matching the no-stale-pid
/// adoption rule.
pub fn confirm_alive(handle: &AttachHandle) -> bool {
    kill(Pid::from_raw(handle.pid), None).is_ok()
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
