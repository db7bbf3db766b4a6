//! Agent process bootstrap
//!
//! Builds the runtime after the fork, wires the services together and runs
//! the control plane next to three background workers: the guardian pulse,
//! the stats reporter and the Docker-API auth daemon.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::heartbeat::{self, Heartbeat, PULSE_INTERVAL};
use crate::api::types::{CreateHost, InitAgent, Stats};
use crate::api::ControllerClient;
use crate::config::Configuration;
use crate::instance::InstanceManager;
use crate::router::{self, AppState};
use crate::security::AuthDaemon;
use crate::storage::SecretStore;
use crate::system::fingerprint::machine_fingerprint;
use crate::system::stats::HostSampler;

/// Cadence of the controller stats report
const STATS_INTERVAL: Duration = Duration::from_secs(15);

/// Run the agent process; the return value is the process exit code.
pub fn run(pipe: std::os::unix::net::UnixStream, config: Arc<Configuration>) -> i32 {
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.api.workers.max(1))
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build agent runtime: {}", e);
            return 1;
        }
    };

    // Duplicate the pipe so a fatal error can still tell the guardian why
    // the agent is going away.
    let death_pipe = pipe.try_clone();

    match runtime.block_on(serve(pipe, config)) {
        Ok(()) => {
            info!("Agent stopped");
            0
        }
        Err(e) => {
            error!("Agent error: {}", e);
            if let Ok(mut pipe) = death_pipe {
                let _ = heartbeat::write_frame(&mut pipe, &Heartbeat::AgentDied(e.to_string()));
            }
            1
        }
    }
}

async fn serve(pipe: std::os::unix::net::UnixStream, config: Arc<Configuration>) -> Result<()> {
    let secrets = Arc::new(SecretStore::new().context("Failed to open keystore")?);
    let client = Arc::new(
        ControllerClient::new(&config.remote, &secrets)
            .context("Failed to build controller client")?,
    );
    let manager = Arc::new(InstanceManager::new(config.clone(), client.clone()));

    register(&client).await;

    // Guardian pulse
    pipe.set_nonblocking(true)
        .context("Failed to prepare heartbeat pipe")?;
    let pipe = tokio::net::UnixStream::from_std(pipe)
        .context("Failed to adopt heartbeat pipe")?;
    tokio::spawn(pulse_loop(pipe, manager.clone()));

    // Docker-API authorization broker
    let auth_daemon = AuthDaemon::new(
        config.docker.auth_socket_path.clone(),
        config.docker.forbidden_commands.clone(),
        nix::unistd::geteuid().as_raw(),
    );
    tokio::spawn(async move {
        if let Err(e) = auth_daemon.run().await {
            error!("Auth daemon failed: {}", e);
        }
    });

    // Stats reporter
    let shutdown_token = CancellationToken::new();
    tokio::spawn(stats_loop(
        manager.clone(),
        client.clone(),
        shutdown_token.clone(),
    ));

    // HTTP control plane
    let state = AppState {
        manager: manager.clone(),
        secrets: secrets.clone(),
        config: config.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port)
        .parse()
        .context("Invalid bind address")?;
    info!("Starting control plane on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .context("Failed to bind control plane")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                error!("Failed to install SIGINT handler");
                std::future::pending::<()>().await;
            }
            warn!("Received shutdown signal, stopping agent...");
            shutdown_token.cancel();
        })
        .await
        .context("Control plane server error")?;

    // Best-effort tidy-up; startup handles stale sockets anyway.
    let _ = std::fs::remove_file(&config.docker.auth_socket_path);

    Ok(())
}

/// Register with the controller if no secret has been issued yet.
async fn register(client: &ControllerClient) {
    if client.is_initialized() {
        return;
    }

    info!("Registering agent with controller...");
    let data = InitAgent {
        fingerprint: machine_fingerprint(),
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    match client.init(data).await {
        Ok(response) if response.secret_key.is_some() => {
            info!("Agent registered");
            announce_host(client).await;
        }
        Ok(_) => warn!("Controller accepted registration but issued no secret key"),
        Err(e) => warn!("Controller registration failed: {}", e),
    }
}

/// Tell the controller what this host brings to the pool.
async fn announce_host(client: &ControllerClient) {
    let mut system = sysinfo::System::new();
    system.refresh_memory();

    let data = CreateHost {
        fingerprint: machine_fingerprint(),
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string()),
        cpu_cores: num_cpus::get(),
        memory_gb: system.total_memory() / (1024 * 1024 * 1024),
    };
    if let Err(e) = client.create_host(data).await {
        warn!("Host announcement failed: {}", e);
    }
}

/// Send a pulse to the guardian every second. A failed send means the
/// custody channel is gone: destroy and exit.
async fn pulse_loop(mut pipe: tokio::net::UnixStream, manager: Arc<InstanceManager>) {
    let mut interval = tokio::time::interval(PULSE_INTERVAL);

    loop {
        interval.tick().await;

        let frame = match heartbeat::encode(&Heartbeat::AgentPulse) {
            Ok(frame) => frame,
            Err(e) => {
                error!("CRITICAL: failed to encode pulse ({}); destroying", e);
                manager.self_destruct().await;
                std::process::exit(1);
            }
        };
        if let Err(e) = pipe.write_all(&frame).await {
            error!("CRITICAL: guardian pulse failed ({}); destroying", e);
            manager.self_destruct().await;
            std::process::exit(1);
        }
    }
}

/// Report host utilization to the controller while an instance exists.
async fn stats_loop(
    manager: Arc<InstanceManager>,
    client: Arc<ControllerClient>,
    shutdown: CancellationToken,
) {
    let mut sampler = HostSampler::new();
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    interval.tick().await; // Skip the immediate first tick

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Stats reporter stopped");
                return;
            }
            _ = interval.tick() => {}
        }

        let state = match manager.current_state().await {
            Ok(state) => state,
            Err(e) => {
                warn!("Stats reporter could not read state: {}", e);
                continue;
            }
        };
        if state.is_destroyed() {
            continue;
        }

        let (cpu_util, ram_util) = sampler.sample();
        let stats = Stats {
            cpu_util,
            ram_util,
            instance_status: state.status,
        };
        if let Err(e) = client.send_stats(stats).await {
            warn!("Failed to report stats: {}", e);
        }
    }
}
