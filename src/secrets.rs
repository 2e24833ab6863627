#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};

use crate::errors::{AppError, AppResult};

pub const KEYRING_SERVICE: &str = "places-grid-crawler";
pub const API_KEY_ACCOUNT: &str = "google-places-api-key";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialSource {
    Environment,
    Keyring,
}

impl CredentialSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialSource::Environment => "environment",
            CredentialSource::Keyring => "keyring",
        }
    }
}

/// Provider API key lookup: the environment wins, the OS keyring is the fallback.
#[derive(Clone)]
pub struct CredentialStore {
    service_name: String,
    backend: CredentialBackend,
}

#[derive(Clone)]
enum CredentialBackend {
    Keyring,
    #[cfg(test)]
    Memory(Arc<Mutex<HashMap<String, SecretString>>>),
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::new(KEYRING_SERVICE)
    }
}

impl CredentialStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            backend: CredentialBackend::Keyring,
        }
    }

    #[cfg(test)]
    pub fn in_memory() -> Self {
        Self {
            service_name: "in-memory".to_string(),
            backend: CredentialBackend::Memory(Arc::new(Mutex::new(HashMap::new()))),
        }
    }

    pub fn resolve_api_key(
        &self,
        from_env: Option<&SecretString>,
    ) -> AppResult<(SecretString, CredentialSource)> {
        if let Some(key) = from_env.filter(|k| !k.expose_secret().trim().is_empty()) {
            return Ok((key.clone(), CredentialSource::Environment));
        }
        match self.read(API_KEY_ACCOUNT)? {
            Some(key) => {
                debug!(
                    target: "credentials",
                    service = %self.service_name,
                    "using Places API key from keyring"
                );
                Ok((key, CredentialSource::Keyring))
            }
            None => Err(AppError::Config(
                "no Places API key: set GOOGLE_API_KEY or run `places-grid-crawler set-key`"
                    .into(),
            )),
        }
    }

    pub fn store_api_key(&self, key: &SecretString) -> AppResult<()> {
        let trimmed = key.expose_secret().trim();
        if trimmed.is_empty() {
            return Err(AppError::Config("refusing to store an empty API key".into()));
        }
        self.write(API_KEY_ACCOUNT, &SecretString::from(trimmed.to_string()))?;
        info!(
            target: "credentials",
            service = %self.service_name,
            account = API_KEY_ACCOUNT,
            "stored Places API key"
        );
        Ok(())
    }

    pub fn has_api_key(&self) -> AppResult<bool> {
        self.read(API_KEY_ACCOUNT).map(|key| key.is_some())
    }

    fn read(&self, account: &str) -> AppResult<Option<SecretString>> {
        match &self.backend {
            CredentialBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                match entry.get_password() {
                    Ok(value) => Ok(Some(SecretString::from(value))),
                    Err(keyring::Error::NoEntry) => Ok(None),
                    Err(err) => Err(AppError::from(err)),
                }
            }
            #[cfg(test)]
            CredentialBackend::Memory(store) => Ok(store.lock().get(account).cloned()),
        }
    }

    fn write(&self, account: &str, secret: &SecretString) -> AppResult<()> {
        match &self.backend {
            CredentialBackend::Keyring => {
                let entry = keyring::Entry::new(&self.service_name, account)?;
                entry.set_password(secret.expose_secret())?;
                Ok(())
            }
            #[cfg(test)]
            CredentialBackend::Memory(store) => {
                store.lock().insert(account.to_string(), secret.clone());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_key_wins_over_keyring() {
        let store = CredentialStore::in_memory();
        store
            .store_api_key(&SecretString::from("from-keyring".to_string()))
            .unwrap();

        let env_key = SecretString::from("from-env".to_string());
        let (key, source) = store.resolve_api_key(Some(&env_key)).unwrap();
        assert_eq!(key.expose_secret(), "from-env");
        assert_eq!(source, CredentialSource::Environment);

        let (key, source) = store.resolve_api_key(None).unwrap();
        assert_eq!(key.expose_secret(), "from-keyring");
        assert_eq!(source.as_str(), "keyring");
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let store = CredentialStore::in_memory();
        let blank = SecretString::from("   ".to_string());
        assert!(matches!(
            store.resolve_api_key(Some(&blank)),
            Err(AppError::Config(_))
        ));
        assert!(!store.has_api_key().unwrap());
    }

    #[test]
    fn stored_key_is_trimmed() {
        let store = CredentialStore::in_memory();
        store
            .store_api_key(&SecretString::from("  abc123\n".to_string()))
            .unwrap();
        let (key, _) = store.resolve_api_key(None).unwrap();
        assert_eq!(key.expose_secret(), "abc123");
        assert!(store
            .store_api_key(&SecretString::from(String::new()))
            .is_err());
    }
}
