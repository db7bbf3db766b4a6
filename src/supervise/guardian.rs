//! Guardian process - custody watchdog
//!
//! Shares nothing with the agent but the heartbeat pipe. Sustained agent
//! silence, a broken pipe, or an explicit death notice all mean the host
//! can no longer be trusted with customer data; the guardian then runs the
//! self-destruct sequence itself. The one orderly exit is the launcher
//! disappearing, which is a shutdown, not a compromise.

use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{error, info};

use super::heartbeat::{self, FrameError, Heartbeat, PULSE_DEADLINE};
use crate::api::ControllerClient;
use crate::config::Configuration;
use crate::instance::emergency_self_destruct;
use crate::storage::SecretStore;

/// How long a single read waits before the launcher is re-probed
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the guardian loop; the return value is the process exit code.
pub fn run(mut pipe: UnixStream, launcher_pid: Pid, config: &Configuration) -> i32 {
    info!(
        "Guardian watching agent pulses (launcher pid {})",
        launcher_pid
    );

    if let Err(e) = pipe.set_read_timeout(Some(POLL_INTERVAL)) {
        error!("CRITICAL: guardian cannot poll the pipe ({}); destroying", e);
        destruct(config);
        return 1;
    }

    let mut last_pulse = Instant::now();

    loop {
        // Signal 0 probes liveness without delivering anything.
        if kill(launcher_pid, None).is_err() {
            info!("Launcher is gone; guardian shutting down");
            return 0;
        }

        match heartbeat::read_frame(&mut pipe) {
            Ok(Heartbeat::AgentPulse) => {
                last_pulse = Instant::now();
            }
            Ok(Heartbeat::AgentDied(reason)) => {
                error!("CRITICAL: agent reported death: {}", reason);
                destruct(config);
                return 1;
            }
            Err(FrameError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                if last_pulse.elapsed() > PULSE_DEADLINE {
                    error!(
                        "CRITICAL: no agent pulse for {:?}; assuming tamper",
                        PULSE_DEADLINE
                    );
                    destruct(config);
                    return 1;
                }
            }
            Err(e) => {
                error!("CRITICAL: heartbeat pipe broken ({}); assuming tamper", e);
                destruct(config);
                return 1;
            }
        }
    }
}

/// Run the destruct sequence on a private current-thread runtime.
///
/// The controller client is best-effort here: a broken keystore must not
/// stop the wipe.
fn destruct(config: &Configuration) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("CRITICAL: failed to build destruct runtime: {}", e);
            return;
        }
    };

    runtime.block_on(async {
        let client = SecretStore::new()
            .map_err(|e| error!("Keystore unavailable during destruct: {}", e))
            .ok()
            .and_then(|secrets| {
                ControllerClient::new(&config.remote, &secrets)
                    .map_err(|e| error!("Controller client unavailable during destruct: {}", e))
                    .ok()
            });
        emergency_self_destruct(config, client.as_ref()).await;
    });
}
