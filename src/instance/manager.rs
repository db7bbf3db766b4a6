//! Instance manager - the lifecycle state machine

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info};
use uuid::Uuid;

use super::destruct;
use super::types::{
    CreateInstance, InstanceAction, InstanceCreated, InstanceState, InstanceStatus, ManageInstance,
};
use super::volume::{unwrap_dek, LuksVolume};
use super::{InstanceError, InstanceResult};
use crate::api::ControllerClient;
use crate::commands;
use crate::config::Configuration;
use crate::storage::StateStore;
use crate::system::ports::get_free_port;

/// Env-var carrying the wrapped data encryption key
const ENV_WRAPPED_DEK: &str = "QUDATA_WRAPPED_DEK";
/// Env-vars carrying the resource envelope; consumed, not exported
const ENV_CPU_CORES: &str = "QUDATA_CPU_CORES";
const ENV_MEMORY_GB: &str = "QUDATA_MEMORY_GB";
const ENV_GPU_COUNT: &str = "QUDATA_GPU_COUNT";

/// Default log tail length
const LOG_TAIL: u32 = 100;

/// Manager for the single instance on this host.
///
/// All state reads and writes are serialized by one mutex; the on-disk
/// record itself is written atomically by the store.
pub struct InstanceManager {
    config: Arc<Configuration>,
    client: Arc<ControllerClient>,
    store: StateStore,
    lock: Mutex<()>,
}

impl InstanceManager {
    pub fn new(config: Arc<Configuration>, client: Arc<ControllerClient>) -> Self {
        let store = StateStore::new(config.system.state_file.clone());
        Self {
            config,
            client,
            store,
            lock: Mutex::new(()),
        }
    }

    /// Read the current instance record.
    pub async fn current_state(&self) -> InstanceResult<InstanceState> {
        let _guard = self.lock.lock().await;
        Ok(self.store.load()?)
    }

    /// Create the instance: encrypted volume first, container second,
    /// state record last. Every failure branch rolls back the volume so
    /// the host is left exactly as it was at entry.
    pub async fn create(&self, mut params: CreateInstance) -> InstanceResult<InstanceCreated> {
        let _guard = self.lock.lock().await;

        let state = self.store.load()?;
        if !state.is_destroyed() {
            error!(
                "Create refused: instance '{}' exists with status '{}'",
                state.instance_id, state.status
            );
            return Err(InstanceError::AlreadyExists {
                instance_id: state.instance_id,
                status: state.status,
            });
        }

        info!(
            "Received request to create a new instance with image {}:{}",
            params.image, params.image_tag
        );

        let wrapped_dek = params
            .env_variables
            .remove(ENV_WRAPPED_DEK)
            .filter(|v| !v.is_empty())
            .ok_or(InstanceError::MissingWrappedDek)?;
        let dek = unwrap_dek(&wrapped_dek)?;

        let instance_id = Uuid::new_v4().to_string();
        std::fs::create_dir_all(&self.config.system.storage_directory)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.config.system.storage_directory,
                std::fs::Permissions::from_mode(0o700),
            )?;
        }

        let volume = LuksVolume::for_instance(&self.config.system.storage_directory, &instance_id);
        volume.provision(params.storage_gb, &dek).await?;

        // The passphrase is only needed by luksFormat/luksOpen; wipe it
        // before anything else runs.
        drop(dek);
        info!("DEK has been used and wiped from memory.");

        if let Err(e) = volume.make_filesystem().await {
            volume.close().await;
            volume.remove_backing_file();
            return Err(e);
        }

        if let Err(e) = self.registry_login(&params).await {
            volume.close().await;
            volume.remove_backing_file();
            return Err(e);
        }

        let (args, allocated_ports) = match self.build_run_command(&mut params, &volume) {
            Ok(built) => built,
            Err(e) => {
                volume.close().await;
                volume.remove_backing_file();
                return Err(e);
            }
        };

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = commands::run("docker", &arg_refs).await;
        let container_id = output
            .stdout
            .lines()
            .last()
            .unwrap_or_default()
            .trim()
            .to_string();
        if !output.success || container_id.is_empty() {
            volume.close().await;
            volume.remove_backing_file();
            return Err(InstanceError::Container(output.stderr));
        }

        info!("Container '{}' started successfully.", short_id(&container_id));

        let new_state = InstanceState {
            instance_id,
            container_id: container_id.clone(),
            status: InstanceStatus::Running,
            luks_device_path: volume.backing_file.to_string_lossy().to_string(),
            luks_mapper_name: volume.mapper_name.clone(),
            allocated_ports: allocated_ports.clone(),
        };
        if let Err(e) = self.store.save(&new_state) {
            error!("CRITICAL: failed to persist instance state: {}", e);
            commands::run("docker", &["rm", "-f", &container_id]).await;
            volume.close().await;
            volume.remove_backing_file();
            return Err(InstanceError::StatePersist);
        }

        Ok(InstanceCreated {
            success: true,
            ports: allocated_ports,
            tunnel_host: None,
            tunnel_token: None,
        })
    }

    /// Apply a power action to the current instance.
    pub async fn manage(&self, params: ManageInstance) -> InstanceResult<()> {
        if params.action == InstanceAction::Delete {
            self.self_destruct().await;
            info!("Instance deletion completed via self-destruct sequence.");
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let mut state = self.store.load()?;
        if state.is_destroyed() || state.container_id.is_empty() {
            return Err(InstanceError::NoInstance);
        }

        let (verb, new_status) = match params.action {
            InstanceAction::Stop => ("stop", InstanceStatus::Paused),
            InstanceAction::Start => ("start", InstanceStatus::Running),
            InstanceAction::Restart => ("restart", InstanceStatus::Running),
            InstanceAction::Delete => unreachable!(),
        };

        info!(
            "Executing action '{}' on container {}...",
            params.action,
            short_id(&state.container_id)
        );
        let output = commands::run("docker", &[verb, &state.container_id]).await;

        if output.success {
            state.status = new_status;
            self.store.save(&state)?;
            info!("Action '{}' completed successfully.", params.action);
            Ok(())
        } else {
            state.status = InstanceStatus::Error;
            self.store.save(&state)?;
            Err(InstanceError::Container(format!(
                "Failed to execute action '{}': {}",
                params.action, output.stderr
            )))
        }
    }

    /// Fetch the container log tail.
    pub async fn logs(&self) -> InstanceResult<String> {
        let state = self.current_state().await?;
        if state.container_id.is_empty() {
            return Err(InstanceError::Logs("Container ID is missing.".into()));
        }

        let tail = format!("--tail={}", LOG_TAIL);
        let output = commands::run("docker", &["logs", &tail, &state.container_id]).await;
        if output.success {
            Ok(if output.stdout.is_empty() {
                output.stderr
            } else {
                output.stdout
            })
        } else {
            Err(InstanceError::Logs(format!(
                "STDERR: {}\nSTDOUT: {}",
                output.stderr, output.stdout
            )))
        }
    }

    /// Run the self-destruct sequence. Idempotent and best-effort; never fails.
    pub async fn self_destruct(&self) {
        destruct::run(&self.config, &self.store, Some(&self.client), &self.lock).await;
    }

    async fn registry_login(&self, params: &CreateInstance) -> InstanceResult<()> {
        let (registry, login, password) = match (&params.registry, &params.login, &params.password)
        {
            (Some(r), Some(l), Some(p)) => (r, l, p),
            _ => return Ok(()),
        };

        info!("Logging in to registry {}...", registry);
        let output = commands::run_with_stdin(
            "docker",
            &["login", registry, "--username", login, "--password-stdin"],
            Some(password),
        )
        .await;
        if !output.success {
            return Err(InstanceError::RegistryLogin(output.stderr));
        }
        Ok(())
    }

    /// Assemble the `docker run` argv and the resolved port map.
    fn build_run_command(
        &self,
        params: &mut CreateInstance,
        volume: &LuksVolume,
    ) -> InstanceResult<(Vec<String>, HashMap<String, String>)> {
        let cpu_cores = params
            .env_variables
            .remove(ENV_CPU_CORES)
            .unwrap_or_else(|| "1".into());
        let memory_gb = params
            .env_variables
            .remove(ENV_MEMORY_GB)
            .unwrap_or_else(|| "2".into());
        let gpu_count = params
            .env_variables
            .remove(ENV_GPU_COUNT)
            .unwrap_or_else(|| "0".into());

        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--rm".into()];
        if !self.config.docker.runtime.is_empty() {
            args.push(format!("--runtime={}", self.config.docker.runtime));
        }
        args.push(format!("--cpus={}", cpu_cores));
        args.push(format!("--memory={}g", memory_gb));
        if gpu_count.parse::<u32>().unwrap_or(0) > 0 {
            args.push(format!("--gpus=count={}", gpu_count));
        }

        let mut allocated_ports = HashMap::new();
        for (container_port, host_port_def) in &params.ports {
            let host_port = if host_port_def.eq_ignore_ascii_case("auto") {
                get_free_port()?.to_string()
            } else {
                host_port_def.clone()
            };
            args.push("-p".into());
            args.push(format!("{}:{}", host_port, container_port));
            allocated_ports.insert(container_port.clone(), host_port);
        }

        if params.ssh_enabled && !params.ports.contains_key("22") {
            let host_port = get_free_port()?.to_string();
            args.push("-p".into());
            args.push(format!("{}:22", host_port));
            allocated_ports.insert("22".into(), host_port);
        }

        args.push("--mount".into());
        args.push(format!(
            "type=bind,source={},destination=/data",
            volume.mapper_path().display()
        ));

        for (key, value) in &params.env_variables {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push(format!("{}:{}", params.image, params.image_tag));
        if let Some(command) = &params.command {
            args.extend(command.split_whitespace().map(String::from));
        }

        Ok((args, allocated_ports))
    }
}

fn short_id(container_id: &str) -> &str {
    &container_id[..container_id.len().min(12)]
}
