//! Domain types shared by every conclave crate.
//!
//! Everything that more than one component needs to agree on lives here and
//! nowhere else: the branded identifiers and the session mode / message role
//! enumerations.

pub mod ids;
pub mod mode;

pub use ids::{MessageId, ProjectId, SessionId};
pub use mode::{ParseEnumError, Role, SessionMode};
