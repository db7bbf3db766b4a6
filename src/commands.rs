//! External tool invocation
//!
//! Thin wrapper around child processes (`docker`, `cryptsetup`, `mkfs.ext4`,
//! `shred`). Failures to spawn are folded into a failed [`CommandOutput`] so
//! best-effort callers (the self-destruct path) never have to branch on a
//! separate error channel.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished child process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
}

impl CommandOutput {
    fn spawn_failure(err: std::io::Error) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: err.to_string(),
            code: None,
        }
    }
}

/// Run a command, capturing stdout/stderr and the exit code.
pub async fn run(program: &str, args: &[&str]) -> CommandOutput {
    run_with_stdin(program, args, None).await
}

/// Run a command, optionally feeding `input` to its stdin.
///
/// Secrets are always passed this way, never as argv elements.
pub async fn run_with_stdin(program: &str, args: &[&str], input: Option<&str>) -> CommandOutput {
    debug!("Running: {} {}", program, args.join(" "));

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return CommandOutput::spawn_failure(e),
    };

    if let Some(input) = input {
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(input.as_bytes()).await {
                return CommandOutput::spawn_failure(e);
            }
            // Closing stdin lets tools that read-to-EOF proceed.
            drop(stdin);
        }
    }

    match child.wait_with_output().await {
        Ok(output) => CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            code: output.status.code(),
        },
        Err(e) => CommandOutput::spawn_failure(e),
    }
}
