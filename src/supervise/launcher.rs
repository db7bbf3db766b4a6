//! Supervision tree launcher
//!
//! The long-lived parent process. Forks the guardian once, then keeps an
//! agent alive: fork, wait, respawn after a short delay. If the guardian
//! itself is gone the host is no longer guarded and the launcher refuses
//! to continue.

use std::os::unix::net::UnixStream;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use nix::sys::signal::kill;
use nix::sys::wait::waitpid;
use nix::unistd::{fork, ForkResult};
use tracing::{error, info, warn};

use super::heartbeat::RESPAWN_DELAY;
use super::{agent, guardian};
use crate::config::Configuration;

/// Run the supervision tree. Only returns on unrecoverable failure.
pub fn run(config: Arc<Configuration>) -> Result<()> {
    let (agent_pipe, guardian_pipe) =
        UnixStream::pair().context("Failed to create heartbeat pipe")?;
    let launcher_pid = nix::unistd::getpid();

    // SAFETY: no runtime threads exist yet; both children call only
    // fork-safe code before building their own runtimes.
    let guardian_pid = match unsafe { fork() }.context("Failed to fork guardian")? {
        ForkResult::Child => {
            drop(agent_pipe);
            let code = guardian::run(guardian_pipe, launcher_pid, &config);
            std::process::exit(code);
        }
        ForkResult::Parent { child } => child,
    };
    drop(guardian_pipe);
    info!("Guardian running as pid {}", guardian_pid);

    loop {
        match unsafe { fork() }.context("Failed to fork agent")? {
            ForkResult::Child => {
                let pipe = agent_pipe
                    .try_clone()
                    .context("Failed to clone heartbeat pipe")?;
                let code = agent::run(pipe, Arc::clone(&config));
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                info!("Agent running as pid {}", child);
                match waitpid(child, None) {
                    Ok(status) => warn!("Agent exited: {:?}", status),
                    Err(e) => warn!("waitpid on agent failed: {}", e),
                }

                if kill(guardian_pid, None).is_err() {
                    error!("Guardian is gone; refusing to run unguarded");
                    bail!("guardian process died");
                }

                std::thread::sleep(RESPAWN_DELAY);
                info!("Respawning agent...");
            }
        }
    }
}
