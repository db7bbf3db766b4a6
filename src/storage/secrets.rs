//! Agent secret persistence in the OS keystore

use std::sync::Arc;

use keyring::Entry;
use thiserror::Error;

/// Keystore entry name for the shared agent secret
const AGENT_SECRET_KEY: &str = "agent-secret";

/// Default keystore service name
pub const KEYRING_SERVICE: &str = "qudata-agent-service";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("Keystore error: {0}")]
    Keystore(#[from] keyring::Error),
}

/// Store for the shared agent secret.
///
/// The secret is created once on the first successful controller `init` and
/// is never rotated; only self-destruct removes it (by shredding the
/// keystore's backing file). One keystore entry is opened up front and
/// shared by all clones.
#[derive(Clone)]
pub struct SecretStore {
    entry: Arc<Entry>,
}

impl SecretStore {
    pub fn new() -> Result<Self, SecretError> {
        Self::with_service(KEYRING_SERVICE)
    }

    pub fn with_service(service: &str) -> Result<Self, SecretError> {
        Ok(Self {
            entry: Arc::new(Entry::new(service, AGENT_SECRET_KEY)?),
        })
    }

    /// Read the agent secret, `None` if it has not been created yet.
    pub fn get_agent_secret(&self) -> Result<Option<String>, SecretError> {
        match self.entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the agent secret.
    pub fn set_agent_secret(&self, secret: &str) -> Result<(), SecretError> {
        self.entry.set_password(secret)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static MOCK: Once = Once::new();

    fn mock_keystore() {
        MOCK.call_once(|| {
            keyring::set_default_credential_builder(keyring::mock::default_credential_builder());
        });
    }

    #[test]
    fn test_missing_secret_is_none() {
        mock_keystore();
        let store = SecretStore::with_service("qudata-agent-test-empty").unwrap();
        assert!(store.get_agent_secret().unwrap().is_none());
    }

    #[test]
    fn test_set_then_get() {
        mock_keystore();
        let store = SecretStore::with_service("qudata-agent-test-roundtrip").unwrap();
        store.set_agent_secret("s3cr3t").unwrap();
        assert_eq!(store.get_agent_secret().unwrap().as_deref(), Some("s3cr3t"));
    }

    #[test]
    fn test_clones_share_the_entry() {
        mock_keystore();
        let store = SecretStore::with_service("qudata-agent-test-clone").unwrap();
        let clone = store.clone();
        store.set_agent_secret("shared").unwrap();
        assert_eq!(clone.get_agent_secret().unwrap().as_deref(), Some("shared"));
    }
}
