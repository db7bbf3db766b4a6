//! Persistent agent storage
//!
//! Two artifacts survive agent restarts: the shared secret in the OS
//! keystore, and the single instance-state record on disk.

mod secrets;
mod state;

pub use secrets::{SecretError, SecretStore};
pub use state::{StateError, StateStore};
