//! Host machine fingerprint
//!
//! sha256 of the machine id, falling back to the hostname when no machine
//! id is available. The fingerprint identifies the host to the controller
//! and fills the ban flag; it is not a secret.

use std::sync::OnceLock;

use sha2::{Digest, Sha256};
use tracing::{info, warn};

const MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

static FINGERPRINT: OnceLock<String> = OnceLock::new();

/// The cached fingerprint of this host.
pub fn machine_fingerprint() -> String {
    FINGERPRINT
        .get_or_init(|| {
            let fingerprint = fingerprint_of(&machine_identity());
            info!("Host fingerprint: {}", fingerprint);
            fingerprint
        })
        .clone()
}

/// sha256 hex digest of an identity string.
pub fn fingerprint_of(identity: &str) -> String {
    hex::encode(Sha256::digest(identity.as_bytes()))
}

fn machine_identity() -> String {
    for path in MACHINE_ID_PATHS {
        if let Ok(content) = std::fs::read_to_string(path) {
            let id = content.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }
    }

    warn!("Failed to retrieve machine ID, falling back to hostname");
    sysinfo::System::host_name().unwrap_or_else(|| "unknown-host".to_string())
}
