use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::driver::Mounter;

/// A mount that takes longer than this to list is treated as dead.
const ENUMERATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartupRecord {
    pid: u32,
    started_at: SystemTime,
}

/// Detects an unclean previous shutdown and reconciles leftover mounts
/// with the kernel before the coordinator accepts any events.
///
/// A startup record is written when the daemon starts and removed on
/// clean shutdown; finding one at startup means the previous instance
/// died with mounts possibly still attached and possibly dead.
pub struct CrashRecovery {
    record_path: PathBuf,
}

impl CrashRecovery {
    pub fn new(state_dir: &Path) -> Self {
        Self { record_path: state_dir.join("startup.json") }
    }

    /// Run recovery, then write a fresh startup record. Returns whether
    /// the previous shutdown was unclean.
    pub async fn run(&self, expected_paths: &[PathBuf], mounter: &dyn Mounter) -> Result<bool> {
        let unclean = self.record_path.exists();

        if unclean {
            warn!("previous instance did not shut down cleanly, checking mounts");
            for path in expected_paths {
                if !path.exists() {
                    continue;
                }
                if enumeration_works(path).await {
                    continue;
                }
                info!(path = %path.display(), "dead mount left behind, forcing unmount");
                if let Err(e) = mounter.unmount(path).await {
                    warn!(path = %path.display(), "recovery unmount failed: {}", e);
                }
            }
        }

        self.write_record().await?;
        Ok(unclean)
    }

    async fn write_record(&self) -> Result<()> {
        if let Some(parent) = self.record_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let record = StartupRecord { pid: std::process::id(), started_at: SystemTime::now() };
        let raw = serde_json::to_vec_pretty(&record)?;
        tokio::fs::write(&self.record_path, raw)
            .await
            .context("writing startup record")?;
        Ok(())
    }

    /// Clean shutdown: drop the record so the next start skips recovery.
    pub async fn mark_clean_shutdown(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.record_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not clear startup record: {}", e);
            }
        }
    }
}

/// A directory listing that errors or hangs marks the mount as dead. The
/// listing runs on a blocking worker because a wedged network mount can
/// stall the thread indefinitely.
async fn enumeration_works(path: &Path) -> bool {
    let path = path.to_path_buf();
    let listing = tokio::task::spawn_blocking(move || std::fs::read_dir(&path).map(|_| ()));
    match tokio::time::timeout(ENUMERATION_TIMEOUT, listing).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(_))) => false,
        Ok(Err(_)) => false,
        Err(_) => false,
    }
}
