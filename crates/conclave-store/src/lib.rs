//! SQLite persistence for projects, sessions and transcripts.
//!
//! One [`Database`] is opened at startup and cloned into the repositories.
//! The orchestration thread is the only writer.

pub mod database;
pub mod error;
pub mod messages;
pub mod projects;
pub mod row_helpers;
pub mod schema;
pub mod sessions;

pub use database::Database;
pub use error::StoreError;
pub use messages::{MessageRepo, MessageRow};
pub use projects::{ProjectRepo, ProjectRow};
pub use sessions::{NewSession, SessionRepo, SessionRow};
