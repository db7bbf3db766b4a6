//! Self-destruct sequence
//!
//! Ordered, idempotent, best-effort: every step queries the world, acts if
//! needed, treats "already gone" as success, and never aborts the steps
//! after it. Both the agent (HTTP delete/emergency, pipe break) and the
//! guardian (pulse loss) invoke this path, possibly concurrently.

use std::path::Path;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::api::types::{Incident, IncidentType};
use crate::api::ControllerClient;
use crate::commands;
use crate::config::Configuration;
use crate::storage::StateStore;
use crate::system::fingerprint::machine_fingerprint;

/// Run the self-destruct sequence outside an agent process.
///
/// The guardian uses this entry point: it owns no [`InstanceManager`], and
/// may not even have a working controller client when it fires.
pub async fn emergency_self_destruct(config: &Configuration, client: Option<&ControllerClient>) {
    let store = StateStore::new(config.system.state_file.clone());
    let lock = Mutex::new(());
    run(config, &store, client, &lock).await;
}

pub(super) async fn run(
    config: &Configuration,
    store: &StateStore,
    client: Option<&ControllerClient>,
    lock: &Mutex<()>,
) {
    error!("CRITICAL: ----- STARTING SELF-DESTRUCT PROCEDURE -----");

    let state = {
        let _guard = lock.lock().await;
        store.load().unwrap_or_default()
    };

    if !state.container_id.is_empty() {
        error!(
            "Removing container {}...",
            &state.container_id[..state.container_id.len().min(12)]
        );
        commands::run("docker", &["rm", "-f", &state.container_id]).await;
    }

    if !state.luks_mapper_name.is_empty() {
        error!("Closing LUKS volume '{}'...", state.luks_mapper_name);
        commands::run("cryptsetup", &["luksClose", &state.luks_mapper_name]).await;
    }

    shred_file(Path::new(&state.luks_device_path)).await;

    error!("Shredding agent keystore");
    shred_file(&config.system.keyring_file).await;

    {
        let _guard = lock.lock().await;
        if let Err(e) = store.clear() {
            error!("Failed to clear instance state: {}", e);
        }
    }

    if let Err(e) = write_ban_flag(&config.system.ban_flag_path) {
        error!("Failed to write ban flag: {}", e);
    }

    let incident = Incident {
        incident_type: IncidentType::PrivacyCorrupted,
        timestamp: chrono::Utc::now().timestamp(),
        instances_killed: true,
    };
    match client {
        Some(client) => match client.send_incident(incident).await {
            Ok(()) => info!("Incident reported to the controller."),
            Err(e) => error!("Failed to report the incident: {}", e),
        },
        None => error!("No controller client; incident not reported"),
    }

    error!("CRITICAL: ----- SELF-DESTRUCT PROCEDURE COMPLETE -----");
}

/// Shred and unlink a file; a missing or empty path is a no-op.
async fn shred_file(path: &Path) {
    if path.as_os_str().is_empty() || !path.exists() {
        return;
    }
    error!("Shredding file at {}", path.display());
    let path_str = path.to_string_lossy().to_string();
    let output = commands::run("shred", &["-u", "-n", "1", &path_str]).await;
    if !output.success {
        warn!("shred {} failed: {}", path.display(), output.stderr);
    }
}

/// Mark this host as banned; the flag content is the machine fingerprint.
fn write_ban_flag(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let fingerprint = machine_fingerprint();
    std::fs::write(path, &fingerprint)?;
    info!(
        "Banned with fingerprint: {}, stored at {}",
        &fingerprint[..fingerprint.len().min(12)],
        path.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{InstanceManager, InstanceState, InstanceStatus};
    use crate::storage::SecretStore;
    use std::sync::Arc;
    use std::sync::Once;

    static MOCK: Once = Once::new();

    fn test_manager(dir: &std::path::Path) -> InstanceManager {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });

        let mut config = Configuration::default();
        config.system.keyring_file = dir.join("qudata-agent.keyring");
        config.resolve_paths(dir);
        config.ensure_directories().unwrap();
        let config = Arc::new(config);

        let secrets = SecretStore::with_service("qudata-agent-test-destruct").unwrap();
        let client =
            Arc::new(ControllerClient::new(&config.remote, &secrets).expect("client"));
        InstanceManager::new(config.clone(), client)
    }

    #[tokio::test]
    async fn test_destruct_on_clean_host_writes_ban_flag() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        manager.self_destruct().await;

        let ban_flag = dir.path().join(".qudata/.ban-flag");
        let content = std::fs::read_to_string(&ban_flag).unwrap();
        assert_eq!(content, machine_fingerprint());
        assert!(!content.is_empty());

        let state = manager.current_state().await.unwrap();
        assert!(state.is_destroyed());
        assert!(state.container_id.is_empty());
        assert!(state.luks_mapper_name.is_empty());
    }

    #[tokio::test]
    async fn test_destruct_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        manager.self_destruct().await;
        manager.self_destruct().await;

        let state = manager.current_state().await.unwrap();
        assert!(state.is_destroyed());
        assert!(dir.path().join(".qudata/.ban-flag").exists());
    }

    #[tokio::test]
    async fn test_destruct_shreds_backing_file_reference() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(dir.path());

        // A state record pointing at a backing file that no longer exists
        // must not derail the sequence.
        let mut state = InstanceState::default();
        state.instance_id = "11111111-2222-3333-4444-555555555555".into();
        state.status = InstanceStatus::Error;
        state.luks_device_path = dir
            .path()
            .join(".qudata/instances/gone.luks")
            .to_string_lossy()
            .to_string();
        StateStore::new(dir.path().join(".qudata/instance_state.json"))
            .save(&state)
            .unwrap();

        manager.self_destruct().await;
        assert!(manager.current_state().await.unwrap().is_destroyed());
    }
}
