//! Layered configuration for conclave.
//!
//! Settings come from three layers, lowest priority first:
//! 1. Compiled defaults ([`ConclaveSettings::default()`])
//! 2. `~/.conclave/settings.json`, deep-merged over the defaults
//! 3. `CONCLAVE_*` environment variables
//!
//! Command-line flags are applied by the binary on top of the result.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    deep_merge, load_settings, load_settings_from_path, load_with_env, settings_path, validate,
};
pub use types::*;
