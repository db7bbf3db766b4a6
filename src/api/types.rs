//! Controller request and response types

use serde::{Deserialize, Serialize};

use crate::instance::InstanceStatus;

/// Initial registration payload
#[derive(Debug, Clone, Serialize)]
pub struct InitAgent {
    pub fingerprint: String,
    pub hostname: String,
    pub version: String,
}

/// Registration response; `secret_key` is present on first registration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentResponse {
    #[serde(default)]
    pub secret_key: Option<String>,
}

/// Periodic host report
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub cpu_util: f32,
    pub ram_util: f32,
    pub instance_status: InstanceStatus,
}

/// Incident classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentType {
    PrivacyCorrupted,
}

/// Forensic event reported after a self-destruct
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub incident_type: IncidentType,
    pub timestamp: i64,
    pub instances_killed: bool,
}

/// Host announcement ahead of instance placement
#[derive(Debug, Clone, Serialize)]
pub struct CreateHost {
    pub fingerprint: String,
    pub hostname: String,
    pub cpu_cores: usize,
    pub memory_gb: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_type_wire_format() {
        assert_eq!(
            serde_json::to_string(&IncidentType::PrivacyCorrupted).unwrap(),
            "\"privacy_corrupted\""
        );
    }

    #[test]
    fn test_agent_response_without_secret() {
        let response: AgentResponse = serde_json::from_str("{}").unwrap();
        assert!(response.secret_key.is_none());
    }

    #[test]
    fn test_stats_serialization() {
        let stats = Stats {
            cpu_util: 12.5,
            ram_util: 40.0,
            instance_status: InstanceStatus::Running,
        };
        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["instance_status"], "running");
    }
}
