//! Instance lifecycle types

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Lifecycle status of the managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Pending,
    Running,
    Paused,
    Rebooting,
    Error,
    Destroyed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Paused => "paused",
            InstanceStatus::Rebooting => "rebooting",
            InstanceStatus::Error => "error",
            InstanceStatus::Destroyed => "destroyed",
        };
        write!(f, "{}", s)
    }
}

/// The single persisted instance record.
///
/// `status == destroyed` implies empty `container_id` and
/// `luks_mapper_name`; the default record satisfies that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceState {
    pub instance_id: String,
    pub container_id: String,
    pub status: InstanceStatus,
    pub luks_device_path: String,
    pub luks_mapper_name: String,
    pub allocated_ports: HashMap<String, String>,
}

impl Default for InstanceState {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            container_id: String::new(),
            status: InstanceStatus::Destroyed,
            luks_device_path: String::new(),
            luks_mapper_name: String::new(),
            allocated_ports: HashMap::new(),
        }
    }
}

impl InstanceState {
    pub fn is_destroyed(&self) -> bool {
        self.status == InstanceStatus::Destroyed
    }
}

/// Request to create a new instance
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstance {
    pub image: String,
    pub image_tag: String,
    pub storage_gb: u64,

    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub env_variables: HashMap<String, String>,

    /// container-port -> host-port; the value `"auto"` requests an
    /// OS-assigned free port
    #[serde(default)]
    pub ports: HashMap<String, String>,

    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub ssh_enabled: bool,
}

/// Successful create response payload
#[derive(Debug, Clone, Serialize)]
pub struct InstanceCreated {
    pub success: bool,
    pub ports: HashMap<String, String>,
    pub tunnel_host: Option<String>,
    pub tunnel_token: Option<String>,
}

/// Actions accepted by the manage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Restart,
    Delete,
}

impl std::fmt::Display for InstanceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Restart => "restart",
            InstanceAction::Delete => "delete",
        };
        write!(f, "{}", s)
    }
}

/// Request to manage the current instance
#[derive(Debug, Clone, Deserialize)]
pub struct ManageInstance {
    pub action: InstanceAction,
}
