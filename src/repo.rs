use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::{ShareConfig, ShareId};

/// Configuration persistence seam. The serialization format is the
/// implementation's business; it only has to survive process restarts.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn fetch_all(&self) -> Result<Vec<ShareConfig>>;
    async fn save_all(&self, configs: &[ShareConfig]) -> Result<()>;
    async fn save(&self, config: &ShareConfig) -> Result<()>;
    async fn delete(&self, id: ShareId) -> Result<()>;
}

/// JSON file store. One array of camelCase share records; writes go through
/// a tmp file + rename so a crash never leaves a torn config.
pub struct JsonFileRepository {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(path: PathBuf) -> Self {
        Self { path, lock: Mutex::new(()) }
    }

    async fn load(&self) -> Result<Vec<ShareConfig>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading share configuration"),
        };
        serde_json::from_slice(&raw).context("decoding share configuration")
    }

    async fn persist(&self, configs: &[ShareConfig]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_vec_pretty(configs)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigRepository for JsonFileRepository {
    async fn fetch_all(&self) -> Result<Vec<ShareConfig>> {
        let _guard = self.lock.lock().await;
        self.load().await
    }

    async fn save_all(&self, configs: &[ShareConfig]) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.persist(configs).await
    }

    async fn save(&self, config: &ShareConfig) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut configs = self.load().await?;
        match configs.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => configs.push(config.clone()),
        }
        self.persist(&configs).await
    }

    async fn delete(&self, id: ShareId) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut configs = self.load().await?;
        configs.retain(|c| c.id != id);
        self.persist(&configs).await
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct MemoryRepository {
    configs: Mutex<HashMap<ShareId, ShareConfig>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigRepository for MemoryRepository {
    async fn fetch_all(&self) -> Result<Vec<ShareConfig>> {
        Ok(self.configs.lock().await.values().cloned().collect())
    }

    async fn save_all(&self, configs: &[ShareConfig]) -> Result<()> {
        let mut map = self.configs.lock().await;
        map.clear();
        for config in configs {
            map.insert(config.id, config.clone());
        }
        Ok(())
    }

    async fn save(&self, config: &ShareConfig) -> Result<()> {
        self.configs.lock().await.insert(config.id, config.clone());
        Ok(())
    }

    async fn delete(&self, id: ShareId) -> Result<()> {
        self.configs.lock().await.remove(&id);
        Ok(())
    }
}
