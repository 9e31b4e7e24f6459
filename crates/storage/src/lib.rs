use std::{
    collections::HashMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError},
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use shared::domain::UserProfile;
use tracing::warn;

/// Storage key the authentication session is persisted under.
pub const SESSION_STORAGE_KEY: &str = "auth-storage";
pub const SESSION_SCHEMA_VERSION: u32 = 1;

/// String-valued durable slots addressed by a fixed key.
///
/// Calls are synchronous: callers rely on a write having landed before they
/// return control.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// One file per key inside `root`.
#[derive(Debug, Clone)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || key.starts_with('.')
        {
            return Err(anyhow!("invalid storage key '{key}'"));
        }
        Ok(self.root.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read '{}'", path.display())),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.root).with_context(|| {
            format!(
                "failed to create storage directory '{}'",
                self.root.display()
            )
        })?;

        let staging = path.with_extension("json.tmp");
        fs::write(&staging, value)
            .with_context(|| format!("failed to write '{}'", staging.display()))?;
        fs::rename(&staging, &path).with_context(|| {
            format!(
                "failed to move '{}' into place at '{}'",
                staging.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove '{}'", path.display())),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    slots: Mutex<HashMap<String, String>>,
}

impl MemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(key);
        Ok(())
    }
}

/// On-disk shape of the authentication session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub version: u32,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub profile: Option<UserProfile>,
}

impl PersistedSession {
    pub fn anonymous() -> Self {
        Self {
            version: SESSION_SCHEMA_VERSION,
            credential: None,
            profile: None,
        }
    }

    pub fn authenticated(credential: impl Into<String>, profile: UserProfile) -> Self {
        Self {
            version: SESSION_SCHEMA_VERSION,
            credential: Some(credential.into()),
            profile: Some(profile),
        }
    }

    /// Both halves of a signed-in session, or `None` for anything partial.
    pub fn into_parts(self) -> Option<(String, UserProfile)> {
        match (self.credential, self.profile) {
            (Some(credential), Some(profile)) if !credential.is_empty() => {
                Some((credential, profile))
            }
            _ => None,
        }
    }
}

pub fn load_session(store: &dyn KeyValueStore) -> Result<Option<PersistedSession>> {
    let Some(raw) = store.get(SESSION_STORAGE_KEY)? else {
        return Ok(None);
    };
    let session: PersistedSession =
        serde_json::from_str(&raw).context("persisted session is not valid JSON")?;
    if session.version != SESSION_SCHEMA_VERSION {
        warn!(
            version = session.version,
            expected = SESSION_SCHEMA_VERSION,
            "discarding persisted session with unsupported schema version"
        );
        return Ok(None);
    }
    Ok(Some(session))
}

pub fn save_session(store: &dyn KeyValueStore, session: &PersistedSession) -> Result<()> {
    let raw = serde_json::to_string(session).context("failed to encode session")?;
    store.set(SESSION_STORAGE_KEY, &raw)
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
