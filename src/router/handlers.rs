//! Control-plane request handlers

use axum::{
    extract::{Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use super::extract::Json;
use super::AppState;
use crate::error::{AgentError, Result};
use crate::instance::{CreateInstance, InstanceAction, ManageInstance};
use crate::system::SshKeyManager;

/// Liveness probe
pub async fn ping() -> Json<Value> {
    Json(json!({ "ok": true, "data": null }))
}

#[derive(Debug, Deserialize)]
pub struct AddSshKeyRequest {
    #[serde(default)]
    pub ssh_pubkey: Option<String>,
}

/// Install an operator SSH public key
pub async fn add_ssh_key(
    State(state): State<AppState>,
    Json(request): Json<AddSshKeyRequest>,
) -> Result<Json<Value>> {
    let pubkey = request
        .ssh_pubkey
        .ok_or_else(|| AgentError::BadRequest("Missing 'ssh_pubkey' field.".into()))?;

    let manager = SshKeyManager::new(state.config.system.authorized_keys_path.clone());
    manager.add_pubkey(&pubkey).map_err(|e| {
        if e.kind() == std::io::ErrorKind::InvalidInput {
            AgentError::BadRequest(e.to_string())
        } else {
            error!("Failed to add SSH key: {}", e);
            AgentError::Internal("Could not process SSH key.".into())
        }
    })?;

    Ok(Json(json!({ "ok": true, "data": null })))
}

#[derive(Debug, Deserialize)]
pub struct InstancesQuery {
    #[serde(default)]
    pub logs: Option<bool>,
}

/// Current instance state, optionally with a log tail
pub async fn get_instances(
    State(state): State<AppState>,
    Query(query): Query<InstancesQuery>,
) -> Result<Json<Value>> {
    let record = state.manager.current_state().await?;

    let mut data = serde_json::to_value(&record)
        .map_err(|e| AgentError::Internal(e.to_string()))?;

    if query.logs.unwrap_or(false) && !record.container_id.is_empty() {
        match state.manager.logs().await {
            Ok(logs) => data["logs"] = json!(logs),
            Err(e) => data["logs_error"] = json!(e.to_string()),
        }
    }

    Ok(Json(json!({ "ok": true, "data": data })))
}

/// Create the instance
pub async fn create_instance(
    State(state): State<AppState>,
    Json(params): Json<CreateInstance>,
) -> Result<(StatusCode, Json<Value>)> {
    let created = state.manager.create(params).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "data": created })),
    ))
}

/// Apply a power action to the instance
pub async fn manage_instance(
    State(state): State<AppState>,
    Json(params): Json<ManageInstance>,
) -> Result<Json<Value>> {
    state.manager.manage(params).await?;
    Ok(Json(json!({ "ok": true })))
}

/// Destroy the instance
pub async fn delete_instance(State(state): State<AppState>) -> Result<Json<Value>> {
    state
        .manager
        .manage(ManageInstance {
            action: InstanceAction::Delete,
        })
        .await?;
    Ok(Json(json!({ "ok": true })))
}

/// Schedule an orderly agent shutdown
pub async fn shutdown() -> (StatusCode, Json<Value>) {
    warn!("Shutdown request received. Agent is shutting down...");

    tokio::spawn(async {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        let _ = nix::sys::signal::kill(nix::unistd::getpid(), nix::sys::signal::Signal::SIGINT);
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "message": "Agent shutdown initiated." })),
    )
}

/// Trigger the self-destruct sequence asynchronously
pub async fn emergency(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    error!("CRITICAL: emergency self-destruct sequence initiated via API!");

    let manager = state.manager.clone();
    tokio::spawn(async move { manager.self_destruct().await });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "ok": true, "message": "Emergency self-destruct sequence initiated." })),
    )
}
