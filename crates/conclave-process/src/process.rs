use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use conclave_core::SessionId;

use crate::decode::Utf8Decoder;
use crate::errors::{ProcessError, Result};
use crate::invocation::SpawnSpec;

pub const PTY_COLS: u16 = 120;
pub const PTY_ROWS: u16 = 40;

const READ_CHUNK_SIZE: usize = 8 * 1024;
/// How long the waiter lets the reader finish before reporting exit.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
/// How long a hangup may be ignored before the process group is killed.
pub const KILL_GRACE: Duration = Duration::from_millis(1000);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const INTERRUPT: u8 = 0x03;
#[cfg(unix)]
const EIO: i32 = 5;

/// Everything a running process reports, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProcessEvent {
    Started { pid: Option<u32> },
    Output(String),
    /// Non-fatal on its own; a terminal event follows if the process is gone.
    Errored(String),
    Finished(i32),
    Killed,
}

impl ProcessEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Killed)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ProcessState {
    NotStarted,
    Started,
    /// At least one chunk of output has been read.
    Running,
    Finished(i32),
    Killed,
    Errored(String),
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Killed | Self::Errored(_))
    }
}

type SharedState = Arc<Mutex<ProcessState>>;

/// Move to `next` unless already terminal. Returns whether the move happened.
fn transition(state: &SharedState, next: ProcessState) -> bool {
    let mut current = state.lock();
    if current.is_terminal() {
        return false;
    }
    *current = next;
    true
}

/// One agent process and the write side of its terminal.
///
/// Output and exit arrive on the event channel passed to [`spawn`](Self::spawn);
/// this handle only writes, signals and releases.
pub struct SessionProcess {
    session_id: SessionId,
    pid: Option<u32>,
    state: SharedState,
    kill_requested: Arc<AtomicBool>,
    closed: bool,
    writer: Option<Box<dyn Write + Send>>,
    master: Option<Box<dyn MasterPty + Send>>,
    killer: Option<Box<dyn ChildKiller + Send + Sync>>,
}

impl fmt::Debug for SessionProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionProcess")
            .field("session_id", &self.session_id)
            .field("pid", &self.pid)
            .field("state", &*self.state.lock())
            .field("closed", &self.closed)
            .finish()
    }
}

impl SessionProcess {
    /// Launch the agent described by `spec`.
    ///
    /// `Started` is already on `events` when this returns.
    pub fn spawn(spec: SpawnSpec, events: UnboundedSender<ProcessEvent>) -> Result<Self> {
        let state: SharedState = Arc::new(Mutex::new(ProcessState::NotStarted));
        let binary = spec.binary.display().to_string();

        let pair = native_pty_system()
            .openpty(PtySize {
                cols: PTY_COLS,
                rows: PTY_ROWS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| ProcessError::Pty(e.to_string()))?;

        let mut command = CommandBuilder::new(&spec.binary);
        command.args(spec.args());
        command.cwd(&spec.working_dir);
        command.env("CONCLAVE_SESSION_ID", spec.session_id.as_str());
        for (key, value) in &spec.invocation.env {
            command.env(key, value);
        }

        let mut child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| ProcessError::Spawn {
                binary: binary.clone(),
                detail: e.to_string(),
            })?;
        drop(pair.slave);

        let reader = match pair.master.try_clone_reader() {
            Ok(reader) => reader,
            Err(e) => {
                terminate(child.as_mut());
                return Err(ProcessError::Pty(e.to_string()));
            }
        };
        let writer = match pair.master.take_writer() {
            Ok(writer) => writer,
            Err(e) => {
                terminate(child.as_mut());
                return Err(ProcessError::Pty(e.to_string()));
            }
        };

        let pid = child.process_id();
        let killer = child.clone_killer();
        let kill_requested = Arc::new(AtomicBool::new(false));

        *state.lock() = ProcessState::Started;
        let _ = events.send(ProcessEvent::Started { pid });
        info!(
            session_id = %spec.session_id,
            pid,
            binary = %binary,
            mode = %spec.mode,
            cwd = %spec.working_dir.display(),
            "agent process started"
        );

        let (reader_done_tx, reader_done_rx) = std_mpsc::channel::<()>();
        let short = spec.session_id.short().to_string();

        let reader_thread = thread::Builder::new()
            .name(format!("pty-reader-{short}"))
            .spawn({
                let events = events.clone();
                let state = Arc::clone(&state);
                let session_id = spec.session_id.clone();
                move || read_loop(reader, events, state, session_id, reader_done_tx)
            });
        if let Err(e) = reader_thread {
            terminate(child.as_mut());
            fail_start(&state, &events, &e);
            return Err(ProcessError::Thread(e));
        }

        let waiter_thread = thread::Builder::new()
            .name(format!("pty-waiter-{short}"))
            .spawn({
                let events = events.clone();
                let state = Arc::clone(&state);
                let kill_requested = Arc::clone(&kill_requested);
                let session_id = spec.session_id.clone();
                move || {
                    wait_loop(child, pid, reader_done_rx, events, state, kill_requested, session_id)
                }
            });
        if let Err(e) = waiter_thread {
            // The child went down with the closure; make sure the process does too.
            let mut killer = killer;
            let _ = killer.kill();
            fail_start(&state, &events, &e);
            return Err(ProcessError::Thread(e));
        }

        Ok(Self {
            session_id: spec.session_id,
            pid,
            state,
            kill_requested,
            closed: false,
            writer: Some(writer),
            master: Some(pair.master),
            killer: Some(killer),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write raw bytes and flush.
    pub fn send_input(&mut self, bytes: &[u8]) -> Result<()> {
        if self.state.lock().is_terminal() {
            return Err(ProcessError::Closed);
        }
        let writer = self.writer.as_mut().ok_or(ProcessError::Closed)?;
        writer.write_all(bytes).map_err(ProcessError::Write)?;
        writer.flush().map_err(ProcessError::Write)
    }

    pub fn send_line(&mut self, text: &str) -> Result<()> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.send_input(&line)
    }

    /// Ask the agent to stop its current turn. Advisory.
    pub fn interrupt(&mut self) -> Result<()> {
        debug!(session_id = %self.session_id, "interrupt");
        self.send_input(&[INTERRUPT])
    }

    /// Terminate the process. Only the first call has any effect.
    ///
    /// Sends a hangup; if the process is still alive after [`KILL_GRACE`]
    /// the waiter kills its whole process group. A process that dies from
    /// either is reported as `Killed`; one that handles the hangup and exits
    /// cleanly is reported as `Finished`.
    pub fn kill(&mut self) {
        if self.kill_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.writer = None;
        if self.state.lock().is_terminal() {
            return;
        }
        if let Some(killer) = self.killer.as_mut() {
            match killer.kill() {
                Ok(()) => info!(session_id = %self.session_id, pid = self.pid, "agent process killed"),
                Err(e) => debug!(session_id = %self.session_id, error = %e, "kill signal not delivered"),
            }
        }
    }

    /// Release the terminal. Called once the process has exited and its
    /// events are drained; safe to call again.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.writer = None;
        self.killer = None;
        self.master = None;
        self.closed = true;
        debug!(session_id = %self.session_id, "process handle closed");
    }
}

fn terminate(child: &mut (dyn Child + Send + Sync)) {
    let _ = child.kill();
    let _ = child.wait();
}

fn fail_start(state: &SharedState, events: &UnboundedSender<ProcessEvent>, err: &std::io::Error) {
    let message = format!("failed to start I/O thread: {err}");
    transition(state, ProcessState::Errored(message.clone()));
    let _ = events.send(ProcessEvent::Errored(message));
    let _ = events.send(ProcessEvent::Finished(-1));
}

fn read_loop(
    mut reader: Box<dyn Read + Send>,
    events: UnboundedSender<ProcessEvent>,
    state: SharedState,
    session_id: SessionId,
    _done: std_mpsc::Sender<()>,
) {
    let mut decoder = Utf8Decoder::default();
    let mut buf = [0_u8; READ_CHUNK_SIZE];
    let mut total = 0_usize;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                let text = decoder.push(&buf[..n]);
                if text.is_empty() {
                    continue;
                }
                {
                    let mut current = state.lock();
                    if *current == ProcessState::Started {
                        *current = ProcessState::Running;
                    }
                }
                if events.send(ProcessEvent::Output(text)).is_err() {
                    debug!(session_id = %session_id, "event receiver dropped, reader stopping");
                    return;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            #[cfg(unix)]
            Err(e) if e.raw_os_error() == Some(EIO) => break,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "pty read failed");
                break;
            }
        }
    }
    let tail = decoder.finish();
    if !tail.is_empty() {
        let _ = events.send(ProcessEvent::Output(tail));
    }
    debug!(session_id = %session_id, bytes = total, "pty reader reached end of stream");
    // Dropping `_done` releases the waiter.
}

fn wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    reader_done: std_mpsc::Receiver<()>,
    events: UnboundedSender<ProcessEvent>,
    state: SharedState,
    kill_requested: Arc<AtomicBool>,
    session_id: SessionId,
) {
    // Polled rather than a blocking wait so a pending kill can be escalated
    // while the child is still unreaped and its pid cannot be reused.
    let mut kill_deadline: Option<Instant> = None;
    let mut escalated = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(e) => break Err(e),
        }
        if kill_requested.load(Ordering::SeqCst) && !escalated {
            let deadline = *kill_deadline.get_or_insert_with(|| Instant::now() + KILL_GRACE);
            if Instant::now() >= deadline {
                escalated = force_kill(child.as_mut(), pid, &session_id);
            }
        }
        thread::sleep(WAIT_POLL_INTERVAL);
    };
    let _ = reader_done.recv_timeout(READER_DRAIN_TIMEOUT);

    match status {
        Ok(status) if escalated || (kill_requested.load(Ordering::SeqCst) && !status.success()) => {
            transition(&state, ProcessState::Killed);
            info!(session_id = %session_id, escalated, "agent process exited after kill");
            let _ = events.send(ProcessEvent::Killed);
        }
        Ok(status) => {
            let code = status.exit_code() as i32;
            transition(&state, ProcessState::Finished(code));
            info!(session_id = %session_id, code, "agent process exited");
            let _ = events.send(ProcessEvent::Finished(code));
        }
        Err(e) => {
            let message = format!("wait failed: {e}");
            transition(&state, ProcessState::Errored(message.clone()));
            warn!(session_id = %session_id, error = %e, "agent process wait failed");
            let _ = events.send(ProcessEvent::Errored(message));
            let _ = events.send(ProcessEvent::Finished(-1));
        }
    }
}

/// SIGKILL the child's process group. The child leads its own session on
/// the terminal, so the group also takes down anything it spawned.
#[cfg(unix)]
fn force_kill(_child: &mut (dyn Child + Send + Sync), pid: Option<u32>, session_id: &SessionId) -> bool {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return false;
    };
    let pid = Pid::from_raw(raw);
    match killpg(pid, Signal::SIGKILL).or_else(|_| kill(pid, Signal::SIGKILL)) {
        Ok(()) => {
            warn!(session_id = %session_id, pid = raw, "hangup ignored, sent SIGKILL");
            true
        }
        Err(e) => {
            warn!(session_id = %session_id, pid = raw, error = %e, "SIGKILL not delivered");
            false
        }
    }
}

#[cfg(not(unix))]
fn force_kill(child: &mut (dyn Child + Send + Sync), _pid: Option<u32>, session_id: &SessionId) -> bool {
    match child.kill() {
        Ok(()) => true,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "forced kill failed");
            false
        }
    }
}
