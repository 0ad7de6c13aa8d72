//! Session engine for conclave.
//!
//! [`AppState`] owns the running agent processes and the persisted
//! projects, sessions and transcripts. A front end feeds it [`Command`]s
//! and calls [`AppState::poll`] once per tick; neither blocks on a child
//! process.

mod ansi;
mod buffer;
pub mod config;
pub mod errors;
mod launch;
pub mod pool;
pub mod state;

pub use ansi::strip_ansi;
pub use config::RuntimeConfig;
pub use errors::{Result, RuntimeError};
pub use pool::{PollReport, SessionExit, SessionPool};
pub use state::{AppState, Command, CommandOutcome, CommandReply, Snapshot};
