use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::config::Protocol;

/// A stored secret for one (server, user, protocol, port) tuple. Never
/// serialized by the general config store and never printed in full.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub server: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"***")
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum KeystoreError {
    /// Stored data exists but cannot be decoded. Distinct from "not found"
    /// so callers can surface corruption instead of silently re-prompting.
    #[error("stored credential data could not be decoded: {0}")]
    Decode(String),

    #[error("keystore I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// The seam to the platform secret vault. Lookup is by
/// (server, username, protocol); the port participates only in storage
/// identity. Implementations must serialize their operations.
#[async_trait]
pub trait Keystore: Send + Sync {
    /// Returns the credential, or None when nothing is stored.
    async fn get(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<Option<Credential>, KeystoreError>;

    /// Update-then-add semantics: an existing entry for the same tuple is
    /// replaced; otherwise the credential is added.
    async fn store(&self, credential: Credential) -> Result<(), KeystoreError>;

    /// Idempotent: deleting a missing entry succeeds.
    async fn delete(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<(), KeystoreError>;
}

fn lookup_key(server: &str, username: &str, protocol: Protocol) -> String {
    format!("{}://{}@{}", protocol.label().to_lowercase(), username, server)
}

/// File-backed adapter used when no platform vault integration is wired.
/// All operations funnel through one mutex, which is what removes the
/// races under concurrent UI edits.
pub struct FileKeystore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileKeystore {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    async fn load(&self) -> Result<HashMap<String, Credential>, KeystoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw).map_err(|e| KeystoreError::Decode(e.to_string()))
    }

    async fn persist(&self, entries: &HashMap<String, Credential>) -> Result<(), KeystoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(entries)
            .map_err(|e| KeystoreError::Decode(e.to_string()))?;
        // write-then-rename so a crash never leaves a torn keystore
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl Keystore for FileKeystore {
    async fn get(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<Option<Credential>, KeystoreError> {
        let _guard = self.lock.lock().await;
        let entries = self.load().await?;
        Ok(entries.get(&lookup_key(server, username, protocol)).cloned())
    }

    async fn store(&self, credential: Credential) -> Result<(), KeystoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let key = lookup_key(&credential.server, &credential.username, credential.protocol);
        entries.insert(key, credential);
        self.persist(&entries).await
    }

    async fn delete(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<(), KeystoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        if entries.remove(&lookup_key(server, username, protocol)).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }
}

/// In-memory keystore for tests and previews.
#[derive(Default)]
pub struct MemoryKeystore {
    entries: Mutex<HashMap<String, Credential>>,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with(credential: Credential) -> Self {
        let store = Self::new();
        store.store(credential).await.unwrap();
        store
    }
}

#[async_trait]
impl Keystore for MemoryKeystore {
    async fn get(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<Option<Credential>, KeystoreError> {
        let entries = self.entries.lock().await;
        Ok(entries.get(&lookup_key(server, username, protocol)).cloned())
    }

    async fn store(&self, credential: Credential) -> Result<(), KeystoreError> {
        let mut entries = self.entries.lock().await;
        let key = lookup_key(&credential.server, &credential.username, credential.protocol);
        entries.insert(key, credential);
        Ok(())
    }

    async fn delete(
        &self,
        server: &str,
        username: &str,
        protocol: Protocol,
    ) -> Result<(), KeystoreError> {
        let mut entries = self.entries.lock().await;
        entries.remove(&lookup_key(server, username, protocol));
        Ok(())
    }
}
