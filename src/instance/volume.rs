//! LUKS volume lifecycle
//!
//! Each instance owns one encrypted loop volume: a sparse backing file
//! formatted as LUKS2 and opened under a per-instance device-mapper name.
//! The data encryption key arrives wrapped; the unwrapped passphrase lives
//! only between unwrap and `luksOpen` and is zeroed on drop.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use base64::Engine;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::{InstanceError, InstanceResult};
use crate::commands;

const GIB: u64 = 1024 * 1024 * 1024;

/// Unwrapped data encryption key.
///
/// The buffer is overwritten with zeros when dropped.
pub struct Dek(String);

impl Dek {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl Drop for Dek {
    fn drop(&mut self) {
        // SAFETY: zeroing UTF-8 bytes in place keeps the string valid ASCII.
        let bytes = unsafe { self.0.as_bytes_mut() };
        for b in bytes.iter_mut() {
            unsafe { std::ptr::write_volatile(b, 0) };
        }
    }
}

/// Unwrap the controller-delivered DEK into the LUKS passphrase.
///
/// The KEK release happens upstream; the blob handed to the agent is
/// base64. The passphrase is a digest of the decoded material so a
/// malformed or empty blob never yields a usable key.
pub fn unwrap_dek(wrapped: &str) -> InstanceResult<Dek> {
    let material = base64::engine::general_purpose::STANDARD
        .decode(wrapped.trim())
        .map_err(|e| InstanceError::DekUnwrap(e.to_string()))?;
    if material.is_empty() {
        return Err(InstanceError::DekUnwrap("empty key material".into()));
    }
    Ok(Dek(hex::encode(Sha256::digest(&material))))
}

/// One instance's encrypted volume
#[derive(Debug, Clone)]
pub struct LuksVolume {
    pub backing_file: PathBuf,
    pub mapper_name: String,
}

impl LuksVolume {
    /// Derive the backing-file path and mapper name for an instance.
    pub fn for_instance(storage_dir: &Path, instance_id: &str) -> Self {
        let short = &instance_id[..instance_id.len().min(8)];
        Self {
            backing_file: storage_dir.join(format!("{}.luks", instance_id)),
            mapper_name: format!("qudata-inst-{}", short),
        }
    }

    /// The mapped block-device path once the volume is open.
    pub fn mapper_path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.mapper_name)
    }

    /// Create the sparse backing file (0600) and format + open the volume.
    ///
    /// Any failure removes the backing file before returning, leaving the
    /// filesystem as it was at entry.
    pub async fn provision(&self, storage_gb: u64, dek: &Dek) -> InstanceResult<()> {
        info!(
            "Creating LUKS volume at '{}' with size {}GB...",
            self.backing_file.display(),
            storage_gb
        );

        let file = std::fs::File::create(&self.backing_file)?;
        file.set_len(storage_gb * GIB)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        drop(file);

        let backing = self.backing_file.to_string_lossy().to_string();

        let output = commands::run_with_stdin(
            "cryptsetup",
            &["-q", "luksFormat", "--type", "luks2", &backing],
            Some(dek.expose()),
        )
        .await;
        if !output.success {
            self.remove_backing_file();
            return Err(InstanceError::Volume {
                stage: "format",
                stderr: output.stderr,
            });
        }

        let output = commands::run_with_stdin(
            "cryptsetup",
            &["luksOpen", &backing, &self.mapper_name],
            Some(dek.expose()),
        )
        .await;
        if !output.success {
            self.remove_backing_file();
            return Err(InstanceError::Volume {
                stage: "open",
                stderr: output.stderr,
            });
        }

        Ok(())
    }

    /// Create an ext4 filesystem on the mapped device.
    pub async fn make_filesystem(&self) -> InstanceResult<()> {
        let mapped = self.mapper_path().to_string_lossy().to_string();
        let output = commands::run("mkfs.ext4", &["-q", &mapped]).await;
        if !output.success {
            return Err(InstanceError::Volume {
                stage: "create filesystem on",
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Close the device-mapper target, tolerating "already closed".
    pub async fn close(&self) {
        let output = commands::run("cryptsetup", &["luksClose", &self.mapper_name]).await;
        if !output.success {
            warn!(
                "luksClose {} failed: {}",
                self.mapper_name, output.stderr
            );
        }
    }

    /// Unlink the backing file, tolerating "already gone".
    pub fn remove_backing_file(&self) {
        if let Err(e) = std::fs::remove_file(&self.backing_file) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to remove {}: {}",
                    self.backing_file.display(),
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_dek_produces_fixed_length_passphrase() {
        let dek = unwrap_dek("ZA==").unwrap();
        assert_eq!(dek.expose().len(), 64);
        assert!(dek.expose().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_unwrap_dek_is_deterministic() {
        let a = unwrap_dek("c29tZS13cmFwcGVkLWtleQ==").unwrap();
        let b = unwrap_dek("c29tZS13cmFwcGVkLWtleQ==").unwrap();
        assert_eq!(a.expose(), b.expose());
    }

    #[test]
    fn test_unwrap_dek_rejects_garbage() {
        assert!(unwrap_dek("not base64 !!!").is_err());
        assert!(unwrap_dek("").is_err());
    }

    #[test]
    fn test_volume_naming() {
        let volume = LuksVolume::for_instance(
            Path::new("/var/lib/qudata/instances"),
            "0f8fad5b-d9cb-469f-a165-70867728950e",
        );
        assert_eq!(volume.mapper_name, "qudata-inst-0f8fad5b");
        assert_eq!(
            volume.backing_file,
            Path::new("/var/lib/qudata/instances/0f8fad5b-d9cb-469f-a165-70867728950e.luks")
        );
        assert_eq!(
            volume.mapper_path(),
            Path::new("/dev/mapper/qudata-inst-0f8fad5b")
        );
    }

    #[test]
    fn test_remove_backing_file_tolerates_missing() {
        let volume = LuksVolume::for_instance(Path::new("/nonexistent-dir"), "abc");
        volume.remove_backing_file();
    }
}
