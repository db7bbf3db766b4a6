//! Docker-API authorization broker
//!
//! A local UNIX-socket daemon consulted for every Docker API call made
//! through the workload-visible socket. Callers are identified by
//! SO_PEERCRED; the agent's own uid is always trusted, everyone else is
//! checked against the forbidden-command list. Errors fail closed.

use std::path::PathBuf;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::{timeout, Duration};
use tracing::{error, info, warn};

/// Upper bound on a single request payload
const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Bound on how long a peer may take to deliver its request
const RECV_DEADLINE: Duration = Duration::from_secs(2);

/// Authorization decision returned to the Docker authz plugin
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Decision {
    pub allow: bool,
    pub reason: String,
}

impl Decision {
    fn allow(reason: impl Into<String>) -> Self {
        Self {
            allow: true,
            reason: reason.into(),
        }
    }

    fn deny(reason: impl Into<String>) -> Self {
        Self {
            allow: false,
            reason: reason.into(),
        }
    }
}

/// Decide whether a Docker API request is allowed.
///
/// The uid check comes first so the agent is never blocked by policy from
/// managing its own workload.
pub fn authorize(uri: &str, caller_uid: u32, agent_uid: u32, forbidden: &[String]) -> Decision {
    if caller_uid == agent_uid {
        return Decision::allow("trusted uid");
    }

    let uri = uri.to_lowercase();
    for command in forbidden {
        if uri.contains(&command.to_lowercase()) {
            return Decision::deny(format!("forbidden: {}", command));
        }
    }

    Decision::allow("ok")
}

/// The authorization broker daemon.
///
/// Runs as one cooperative task: accept, one bounded read, respond, close.
/// No per-connection tasks and no pipelining.
pub struct AuthDaemon {
    socket_path: PathBuf,
    forbidden: Vec<String>,
    agent_uid: u32,
}

impl AuthDaemon {
    pub fn new(socket_path: impl Into<PathBuf>, forbidden: Vec<String>, agent_uid: u32) -> Self {
        Self {
            socket_path: socket_path.into(),
            forbidden,
            agent_uid,
        }
    }

    /// Bind the socket and serve requests until the task is dropped.
    pub async fn run(self) -> std::io::Result<()> {
        // A stale socket from a previous run must never make bind fail.
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(
                &self.socket_path,
                std::fs::Permissions::from_mode(0o660),
            )?;
        }

        info!(
            "Auth daemon listening on {} (agent uid {})",
            self.socket_path.display(),
            self.agent_uid
        );

        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => {
                    if let Err(e) = self.handle(stream).await {
                        warn!("Auth daemon connection error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Auth daemon failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Serve one connection: single bounded recv, one decision, close.
    async fn handle(&self, mut stream: UnixStream) -> std::io::Result<()> {
        let decision = match self.decide(&mut stream).await {
            Ok(None) => return Ok(()),
            Ok(Some(decision)) => decision,
            Err(e) => {
                warn!("Auth daemon internal error: {}", e);
                Decision::deny("error")
            }
        };

        let body = serde_json::to_vec(&decision).unwrap_or_else(|_| {
            br#"{"allow":false,"reason":"error"}"#.to_vec()
        });
        stream.write_all(&body).await?;
        stream.shutdown().await
    }

    async fn decide(&self, stream: &mut UnixStream) -> std::io::Result<Option<Decision>> {
        let cred = stream.peer_cred()?;
        let caller_uid = cred.uid();

        let mut buf = vec![0u8; MAX_REQUEST_BYTES];
        let n = timeout(RECV_DEADLINE, stream.read(&mut buf))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "recv deadline"))??;
        if n == 0 {
            return Ok(None);
        }

        let request: serde_json::Value = match serde_json::from_slice(&buf[..n]) {
            Ok(value) => value,
            Err(_) => return Ok(Some(Decision::deny("bad json"))),
        };

        let method = request
            .get("RequestMethod")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let uri = request
            .get("RequestUri")
            .or_else(|| request.get("uri"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        let decision = authorize(uri, caller_uid, self.agent_uid, &self.forbidden);
        info!(
            "uid={} {} {} -> {}",
            caller_uid, method, uri, decision.allow
        );
        Ok(Some(decision))
    }
}
