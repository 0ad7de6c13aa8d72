//! Live agent processes and the per-tick drain of their events.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, info, warn};

use conclave_core::{Role, SessionId};
use conclave_process::{ProcessEvent, SessionProcess, SpawnSpec};
use conclave_store::{MessageRepo, MessageRow, SessionRepo};

use crate::ansi::AnsiStripper;
use crate::buffer::OutputBuffer;
use crate::errors::{Result, RuntimeError};

/// A registered process and the receiving end of its events.
#[derive(Debug)]
pub(crate) struct SessionHandle {
    process: SessionProcess,
    events: UnboundedReceiver<ProcessEvent>,
    ansi: AnsiStripper,
}

/// How a drained session ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionExit {
    Finished { code: i32 },
    Killed,
    /// Event channel closed without a terminal event.
    Lost,
}

/// What one [`SessionPool::poll`] did.
#[derive(Clone, Debug, Default)]
pub struct PollReport {
    pub events: usize,
    pub finished: Vec<(SessionId, SessionExit)>,
    /// Human-readable notices for the status line, oldest first.
    pub notices: Vec<String>,
}

impl PollReport {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.finished.is_empty() && self.notices.is_empty()
    }
}

/// Bounded set of running sessions.
///
/// Background output buffers are kept per session id and outlive the
/// handle, so the tail stays visible after the process exits.
#[derive(Debug)]
pub struct SessionPool {
    handles: HashMap<SessionId, SessionHandle>,
    buffers: HashMap<SessionId, OutputBuffer>,
    max_sessions: usize,
    buffer_cap: usize,
}

impl SessionPool {
    pub fn new(max_sessions: usize, buffer_cap: usize) -> Self {
        Self {
            handles: HashMap::new(),
            buffers: HashMap::new(),
            max_sessions,
            buffer_cap,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.handles.contains_key(id)
    }

    pub fn running(&self) -> impl Iterator<Item = &SessionId> {
        self.handles.keys()
    }

    /// Fails with `CapacityExceeded` if one more process would not fit.
    pub fn ensure_capacity(&self) -> Result<()> {
        if self.handles.len() >= self.max_sessions {
            return Err(RuntimeError::CapacityExceeded {
                max: self.max_sessions,
            });
        }
        Ok(())
    }

    /// Spawn and register the process described by `spec`.
    pub fn spawn(&mut self, spec: SpawnSpec) -> Result<()> {
        let id = spec.session_id.clone();
        if self.handles.contains_key(&id) {
            return Err(RuntimeError::AlreadyRunning(id));
        }
        self.ensure_capacity()?;

        let (tx, rx) = unbounded_channel();
        let process = SessionProcess::spawn(spec, tx)?;
        let cap = self.buffer_cap;
        self.buffers
            .entry(id.clone())
            .or_insert_with(|| OutputBuffer::new(cap));
        self.handles.insert(
            id.clone(),
            SessionHandle {
                process,
                events: rx,
                ansi: AnsiStripper::default(),
            },
        );
        info!(session_id = %id, running = self.handles.len(), "session registered");
        Ok(())
    }

    /// Kill, release and unregister without waiting for the exit event.
    pub fn discard(&mut self, id: &SessionId) -> bool {
        match self.handles.remove(id) {
            Some(mut handle) => {
                handle.process.kill();
                handle.process.close();
                debug!(session_id = %id, "session handle discarded");
                true
            }
            None => false,
        }
    }

    /// [`discard`](Self::discard) plus the retained output.
    pub fn forget(&mut self, id: &SessionId) {
        self.discard(id);
        self.buffers.remove(id);
    }

    pub fn send_line(&mut self, id: &SessionId, text: &str) -> Result<()> {
        self.handle_mut(id)?.process.send_line(text)?;
        Ok(())
    }

    pub fn interrupt(&mut self, id: &SessionId) -> Result<()> {
        self.handle_mut(id)?.process.interrupt()?;
        Ok(())
    }

    /// Request termination. The handle stays registered until its `Killed`
    /// event is drained.
    pub fn kill(&mut self, id: &SessionId) -> Result<()> {
        self.handle_mut(id)?.process.kill();
        Ok(())
    }

    pub fn kill_all(&mut self) {
        for handle in self.handles.values_mut() {
            handle.process.kill();
        }
    }

    pub fn output(&self, id: &SessionId) -> Option<&str> {
        self.buffers.get(id).map(OutputBuffer::as_str)
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&SessionId, &str)> {
        self.buffers.iter().map(|(id, buf)| (id, buf.as_str()))
    }

    /// Drain every handle's pending events without blocking.
    ///
    /// Output lands in the session's buffer; for `foreground` it is also
    /// persisted as an assistant message and appended to `transcript`.
    /// Handles whose process ended are closed and removed after the loop,
    /// and their sessions marked inactive.
    pub fn poll(
        &mut self,
        foreground: Option<&SessionId>,
        sessions: &SessionRepo,
        messages: &MessageRepo,
        transcript: &mut Vec<MessageRow>,
    ) -> PollReport {
        let mut report = PollReport::default();
        let cap = self.buffer_cap;

        for (id, handle) in self.handles.iter_mut() {
            let buffer = self
                .buffers
                .entry(id.clone())
                .or_insert_with(|| OutputBuffer::new(cap));
            let is_foreground = foreground == Some(id);
            let mut exit = None;

            loop {
                let event = match handle.events.try_recv() {
                    Ok(event) => event,
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if exit.is_none() {
                            warn!(session_id = %id, "event channel closed without exit status");
                            report
                                .notices
                                .push(format!("session {}: lost contact with process", id.short()));
                            exit = Some(SessionExit::Lost);
                        }
                        break;
                    }
                };
                report.events += 1;

                match event {
                    ProcessEvent::Started { pid } => {
                        debug!(session_id = %id, pid, "process started");
                    }
                    ProcessEvent::Output(text) => {
                        buffer.push(&text);
                        let clean = handle.ansi.push(&text);
                        if is_foreground {
                            if clean.trim().is_empty() {
                                continue;
                            }
                            match messages.append(id, Role::Assistant, &clean) {
                                Ok(row) => transcript.push(row),
                                Err(e) => {
                                    warn!(session_id = %id, error = %e, "failed to persist output");
                                    report
                                        .notices
                                        .push(format!("session {}: {e}", id.short()));
                                }
                            }
                        }
                    }
                    ProcessEvent::Errored(message) => {
                        warn!(session_id = %id, message = %message, "process error");
                        report
                            .notices
                            .push(format!("session {}: {message}", id.short()));
                    }
                    ProcessEvent::Finished(code) => {
                        exit = Some(SessionExit::Finished { code });
                    }
                    ProcessEvent::Killed => {
                        exit = Some(SessionExit::Killed);
                    }
                }
            }

            if let Some(exit) = exit {
                report.finished.push((id.clone(), exit));
            }
        }

        for (id, exit) in &report.finished {
            if let Some(mut handle) = self.handles.remove(id) {
                handle.process.close();
            }
            if let Err(e) = sessions.set_active(id, false) {
                warn!(session_id = %id, error = %e, "failed to mark session inactive");
                report.notices.push(format!("session {}: {e}", id.short()));
            }
            info!(session_id = %id, exit = ?exit, running = self.handles.len(), "session exited");
        }

        report
    }

    fn handle_mut(&mut self, id: &SessionId) -> Result<&mut SessionHandle> {
        self.handles
            .get_mut(id)
            .ok_or_else(|| RuntimeError::SessionNotRunning(id.clone()))
    }
}
