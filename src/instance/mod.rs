//! Instance lifecycle management
//!
//! One confidential-compute instance per host: a Docker (optionally Kata)
//! container backed by a LUKS-encrypted loop volume, tracked by a single
//! persisted state record, destroyed through an idempotent self-destruct
//! sequence.

mod destruct;
mod manager;
mod types;
mod volume;

pub use destruct::emergency_self_destruct;
pub use manager::InstanceManager;
pub use types::{
    CreateInstance, InstanceAction, InstanceCreated, InstanceState, InstanceStatus, ManageInstance,
};
pub use volume::{unwrap_dek, Dek, LuksVolume};

use thiserror::Error;

use crate::storage::StateError;

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("An instance '{instance_id}' already exists with status '{status}'. Please delete it first.")]
    AlreadyExists {
        instance_id: String,
        status: InstanceStatus,
    },

    #[error("No active instance to manage.")]
    NoInstance,

    #[error("QUDATA_WRAPPED_DEK is missing from env_variables. Cannot proceed with encrypted storage.")]
    MissingWrappedDek,

    #[error("Failed to unwrap DEK: {0}")]
    DekUnwrap(String),

    #[error("Failed to create LUKS file container: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Failed to {stage} LUKS volume: {stderr}")]
    Volume { stage: &'static str, stderr: String },

    #[error("Registry login failed: {0}")]
    RegistryLogin(String),

    #[error("Failed to run container: {0}")]
    Container(String),

    #[error("Failed to fetch container logs: {0}")]
    Logs(String),

    #[error("CRITICAL: Failed to save state after container creation. Rolled back.")]
    StatePersist,

    #[error(transparent)]
    State(#[from] StateError),
}

pub type InstanceResult<T> = Result<T, InstanceError>;
