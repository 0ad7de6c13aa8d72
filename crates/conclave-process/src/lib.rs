//! A single agent process running behind a pseudo-terminal.
//!
//! [`SessionProcess::spawn`] starts the agent and hands every observable
//! change to the caller as a [`ProcessEvent`] on one ordered channel. Two
//! blocking threads per process do the I/O; nothing here needs the async
//! runtime beyond its channel type.

mod decode;
mod errors;
mod invocation;
mod process;

pub use errors::{ProcessError, Result};
pub use invocation::{Conversation, InvocationConfig, SpawnSpec};
pub use process::{ProcessEvent, ProcessState, SessionProcess, PTY_COLS, PTY_ROWS};
