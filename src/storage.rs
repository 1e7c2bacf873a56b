// src/storage.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

/// Storage key under which the current installation id is persisted.
pub const INSTALLATION_ID_KEY: &str = "_parse_installation_id";
/// Storage key under which the current user's session token is persisted.
pub const SESSION_TOKEN_KEY: &str = "_parse_session_token";

/// A keychain-like key/value store for the small identifiers the SDK needs to
/// remember between launches: the installation id and the current session token.
///
/// Implementations must be safe to share across tasks. Platform keychains,
/// files or databases can all back this trait; the SDK ships [`InMemoryStorage`].
pub trait ParseStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: String);
    fn remove(&self, key: &str);
}

impl fmt::Debug for dyn ParseStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ParseStorage")
    }
}

/// Process-local storage. Values are lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParseStorage for InMemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Returns the stored installation id, generating and persisting a new
/// lowercase UUID v4 the first time it is requested.
pub fn ensure_installation_id(storage: &dyn ParseStorage) -> String {
    if let Some(existing) = storage.get(INSTALLATION_ID_KEY) {
        return existing;
    }
    let installation_id = Uuid::new_v4().to_string().to_lowercase();
    log::debug!("Generated new installation id {}", installation_id);
    storage.set(INSTALLATION_ID_KEY, installation_id.clone());
    installation_id
}
