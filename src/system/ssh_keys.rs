//! Operator SSH key management
//!
//! Maintains the root authorized_keys file: deduplicated, sorted, written
//! with 0600 permissions under a 0700 parent directory.

use std::collections::BTreeSet;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::PathBuf;

use tracing::{info, warn};

/// Manager for one authorized_keys file
pub struct SshKeyManager {
    path: PathBuf,
}

impl SshKeyManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Add a public key; adding an existing key is a no-op.
    pub fn add_pubkey(&self, pubkey: &str) -> std::io::Result<()> {
        let pubkey = pubkey.trim();
        if pubkey.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty public key",
            ));
        }

        info!(
            "Adding ssh public key: {}...",
            &pubkey[..pubkey.len().min(30)]
        );
        let mut keys = self.read_keys()?;
        if !keys.insert(pubkey.to_string()) {
            warn!("SSH key already present");
            return Ok(());
        }
        self.write_keys(&keys)
    }

    /// Remove a public key; removing an unknown key is a no-op.
    pub fn remove_pubkey(&self, pubkey: &str) -> std::io::Result<()> {
        let pubkey = pubkey.trim();
        if pubkey.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty public key",
            ));
        }

        let mut keys = self.read_keys()?;
        if !keys.remove(pubkey) {
            warn!("SSH key not found");
            return Ok(());
        }
        self.write_keys(&keys)
    }

    /// Drop every authorized key.
    pub fn clear(&self) -> std::io::Result<()> {
        warn!("Clearing all ssh keys");
        self.write_keys(&BTreeSet::new())
    }

    fn read_keys(&self) -> std::io::Result<BTreeSet<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from)
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
            Err(e) => Err(e),
        }
    }

    fn write_keys(&self, keys: &BTreeSet<String>) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o700)
                    .create(parent)?;
            }
        }

        let mut content = keys.iter().cloned().collect::<Vec<_>>().join("\n");
        content.push('\n');
        std::fs::write(&self.path, content)?;
        std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;

        info!("Wrote {} keys to {}", keys.len(), self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIAAAA operator-a";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIBBBB operator-b";

    fn manager() -> (tempfile::TempDir, SshKeyManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = SshKeyManager::new(dir.path().join("ssh/authorized_keys"));
        (dir, manager)
    }

    #[test]
    fn test_add_and_read_back() {
        let (_dir, manager) = manager();
        manager.add_pubkey(KEY_A).unwrap();
        let keys = manager.read_keys().unwrap();
        assert!(keys.contains(KEY_A));
    }

    #[test]
    fn test_add_is_idempotent() {
        let (_dir, manager) = manager();
        manager.add_pubkey(KEY_A).unwrap();
        manager.add_pubkey(KEY_A).unwrap();
        assert_eq!(manager.read_keys().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let (_dir, manager) = manager();
        manager.add_pubkey(KEY_A).unwrap();
        manager.add_pubkey(KEY_B).unwrap();

        manager.remove_pubkey(KEY_A).unwrap();
        assert_eq!(manager.read_keys().unwrap().len(), 1);

        manager.clear().unwrap();
        assert!(manager.read_keys().unwrap().is_empty());
    }

    #[test]
    fn test_empty_key_rejected() {
        let (_dir, manager) = manager();
        assert!(manager.add_pubkey("   ").is_err());
    }

    #[test]
    fn test_file_mode() {
        let (_dir, manager) = manager();
        manager.add_pubkey(KEY_A).unwrap();
        let mode = std::fs::metadata(&manager.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
