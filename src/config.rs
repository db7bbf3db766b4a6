//! Configuration structures and loading

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Main agent configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Enable debug mode
    pub debug: bool,

    /// Control-plane server configuration
    pub api: ApiConfiguration,

    /// System paths and settings
    pub system: SystemConfiguration,

    /// Docker / container runtime configuration
    pub docker: DockerConfiguration,

    /// Remote controller configuration
    pub remote: RemoteConfiguration,
}

impl Configuration {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);
        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config: Configuration =
            toml::from_str(&content).with_context(|| "Failed to parse configuration")?;

        // Resolve relative paths against the config file's parent directory,
        // or the current working directory if it has no parent.
        let base_dir = config_path
            .parent()
            .and_then(|p| if p.as_os_str().is_empty() { None } else { Some(p) })
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        config.resolve_paths(&base_dir);
        config.ensure_directories()?;

        Ok(config)
    }

    /// Resolve all relative paths against the given base directory.
    pub fn resolve_paths(&mut self, base_dir: &Path) {
        self.system.root_directory = resolve_path(&self.system.root_directory, base_dir);
        self.system.storage_directory = resolve_path(&self.system.storage_directory, base_dir);
        self.system.state_file = resolve_path(&self.system.state_file, base_dir);
        self.system.ban_flag_path = resolve_path(&self.system.ban_flag_path, base_dir);
        self.system.keyring_file = resolve_path(&self.system.keyring_file, base_dir);
        self.docker.auth_socket_path = resolve_path(&self.docker.auth_socket_path, base_dir);
    }

    /// Create the directories the agent writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.system.root_directory)?;
        std::fs::create_dir_all(&self.system.storage_directory)?;
        if let Some(parent) = self.system.state_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = self.system.ban_flag_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

/// Resolve a single path. If relative, join with base_dir. If absolute, return as-is.
fn resolve_path(path: &Path, base_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        normalize_path(&base_dir.join(path))
    }
}

/// Normalize a path by resolving `.` and `..` components without requiring it to exist
fn normalize_path(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            std::path::Component::ParentDir => {
                components.pop();
            }
            std::path::Component::CurDir => {}
            c => components.push(c),
        }
    }
    components.iter().collect()
}

/// Control-plane server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfiguration {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// HTTP worker threads
    pub workers: usize,
}

impl Default for ApiConfiguration {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            workers: 3,
        }
    }
}

/// System paths and settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfiguration {
    /// Root directory for all agent data
    pub root_directory: PathBuf,

    /// Directory holding the LUKS backing files
    pub storage_directory: PathBuf,

    /// Path of the persisted instance-state record
    pub state_file: PathBuf,

    /// Path of the ban-flag marker written on self-destruct
    pub ban_flag_path: PathBuf,

    /// Path of the root authorized_keys file
    pub authorized_keys_path: PathBuf,

    /// Backing file of the OS keyring, shredded on self-destruct
    pub keyring_file: PathBuf,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            root_directory: PathBuf::from(".qudata"),
            storage_directory: PathBuf::from(".qudata/instances"),
            state_file: PathBuf::from(".qudata/instance_state.json"),
            ban_flag_path: PathBuf::from(".qudata/.ban-flag"),
            authorized_keys_path: PathBuf::from("/root/.ssh/authorized_keys"),
            keyring_file: default_keyring_file(),
        }
    }
}

fn default_keyring_file() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join(".local/share/keyrings/qudata-agent.keyring")
}

/// Docker / container runtime configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DockerConfiguration {
    /// Container runtime passed to `docker run --runtime`.
    /// An empty string selects the default Docker runtime.
    pub runtime: String,

    /// UNIX socket path of the Docker-API authorization broker
    pub auth_socket_path: PathBuf,

    /// Docker API URI substrings denied to untrusted callers
    pub forbidden_commands: Vec<String>,
}

impl Default for DockerConfiguration {
    fn default() -> Self {
        Self {
            runtime: "io.containerd.run.kata.v2".into(),
            auth_socket_path: PathBuf::from(".qudata/auth.sock"),
            forbidden_commands: default_forbidden_commands(),
        }
    }
}

fn default_forbidden_commands() -> Vec<String> {
    [
        "/containers/create",
        "/exec",
        "/archive",
        "/kill",
        "/commit",
        "/build",
        "/images/create",
        "/volumes/create",
        "/networks/create",
        "/swarm",
        "/plugins",
        "/session",
        "/configs",
        "/secrets",
        "/update",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Remote controller configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfiguration {
    /// Controller API base URL
    pub url: String,

    /// Header carrying the agent secret
    pub header_name: String,

    /// Request timeout in seconds
    pub timeout: u64,
}

impl Default for RemoteConfiguration {
    fn default() -> Self {
        Self {
            url: "https://api.qudata.io".into(),
            header_name: "X-Agent-Secret".into(),
            timeout: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: Configuration = toml::from_str("").unwrap();
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.api.workers, 3);
        assert_eq!(config.remote.header_name, "X-Agent-Secret");
        assert_eq!(config.docker.runtime, "io.containerd.run.kata.v2");
        assert!(config
            .docker
            .forbidden_commands
            .contains(&"/containers/create".to_string()));
    }

    #[test]
    fn test_partial_override() {
        let config: Configuration = toml::from_str(
            r#"
            [api]
            port = 9000

            [docker]
            runtime = ""
            "#,
        )
        .unwrap();
        assert_eq!(config.api.port, 9000);
        assert_eq!(config.api.host, "0.0.0.0");
        assert!(config.docker.runtime.is_empty());
    }

    #[test]
    fn test_load_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[system]\nroot_directory = \"data\"\n").unwrap();

        let config = Configuration::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.system.root_directory, dir.path().join("data"));
        assert!(config.system.root_directory.is_dir());
        assert!(config.system.storage_directory.is_dir());
    }
}
