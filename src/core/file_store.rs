use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use vidfetch_core::models::{Artifact, Platform, Settings};
use vidfetch_core::DownloadError;

use crate::core::filename;

const STAGING_DIR: &str = ".staging";

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub max_age: Duration,
    pub grace: Duration,
    pub max_file_size: u64,
}

impl StoreConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            root: settings.files.download_dir.clone(),
            max_age: settings.max_file_age(),
            grace: settings.grace_period(),
            max_file_size: settings.download.max_file_size_bytes,
        }
    }
}

/// An opened artifact, ready to be streamed.
pub struct ArtifactReader {
    pub artifact: Artifact,
    pub file: tokio::fs::File,
}

struct Inner {
    config: StoreConfig,
    registry: Mutex<HashMap<Uuid, Artifact>>,
}

/// Owns the managed download directory. The registry is the only answer to
/// "does this id exist"; on-disk names are always `<uuid>.<ext>`.
#[derive(Clone)]
pub struct FileStore {
    inner: Arc<Inner>,
}

fn deadline(from: DateTime<Utc>, after: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(after)
        .ok()
        .and_then(|d| from.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

impl FileStore {
    /// Creates the managed directory and clears anything left in it by a
    /// previous run.
    pub async fn open(config: StoreConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.root).await?;
        let removed = purge(&config.root).await?;
        if removed > 0 {
            info!("Purged {} leftover entries from {}", removed, config.root.display());
        }
        tokio::fs::create_dir_all(config.root.join(STAGING_DIR)).await?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.inner.config.root.join(STAGING_DIR)
    }

    pub async fn register(
        &self,
        temp_path: &Path,
        platform: Platform,
        display_name: &str,
    ) -> Result<Artifact, DownloadError> {
        self.register_at(temp_path, platform, display_name, Utc::now())
            .await
    }

    /// Moves a finished file into the store under a fresh id.
    pub async fn register_at(
        &self,
        temp_path: &Path,
        platform: Platform,
        display_name: &str,
        now: DateTime<Utc>,
    ) -> Result<Artifact, DownloadError> {
        let config = &self.inner.config;

        let size_bytes = match tokio::fs::metadata(temp_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("Cannot stat finished file {}: {}", temp_path.display(), e);
                return Err(DownloadError::Internal);
            }
        };

        if size_bytes == 0 {
            error!("Finished file {} is empty", temp_path.display());
            delete_file(temp_path).await;
            return Err(DownloadError::ExtractionFailed(
                "Downloaded file is empty".to_string(),
            ));
        }

        if size_bytes > config.max_file_size {
            warn!(
                "Rejecting {} ({} bytes > {} bytes)",
                temp_path.display(),
                size_bytes,
                config.max_file_size
            );
            delete_file(temp_path).await;
            return Err(DownloadError::file_too_large(config.max_file_size));
        }

        let filename = filename::sanitize_display_name(display_name);
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_string())
            .unwrap_or_else(|| "mp4".to_string());

        let id = Uuid::new_v4();
        let path = config.root.join(format!("{}.{}", id, ext));

        if let Err(e) = move_file(temp_path, &path).await {
            error!(
                "Failed to move {} into {}: {}",
                temp_path.display(),
                path.display(),
                e
            );
            delete_file(temp_path).await;
            return Err(DownloadError::Internal);
        }

        let artifact = Artifact {
            id,
            path,
            filename,
            size_bytes,
            platform,
            created_at: now,
            expires_at: deadline(now, config.max_age),
            first_read_at: None,
        };

        self.inner
            .registry
            .lock()
            .await
            .insert(id, artifact.clone());

        info!(
            "Registered {} ({} bytes) as {}",
            artifact.filename, artifact.size_bytes, artifact.id
        );
        Ok(artifact)
    }

    pub async fn open_for_read(&self, id: Uuid) -> Result<ArtifactReader, DownloadError> {
        self.open_for_read_at(id, Utc::now()).await
    }

    /// Opens an artifact. The first successful read pulls its expiry in to
    /// `now + grace`; later reads inside that window still succeed.
    pub async fn open_for_read_at(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ArtifactReader, DownloadError> {
        let grace = self.inner.config.grace;

        let (artifact, first_read) = {
            let mut registry = self.inner.registry.lock().await;

            let expired = match registry.get(&id) {
                Some(artifact) => artifact.is_expired(now),
                None => return Err(DownloadError::NotFound),
            };

            if expired {
                let stale = registry.remove(&id);
                drop(registry);
                if let Some(stale) = stale {
                    delete_file(&stale.path).await;
                }
                return Err(DownloadError::NotFound);
            }

            let Some(artifact) = registry.get_mut(&id) else {
                return Err(DownloadError::NotFound);
            };

            let first_read = artifact.first_read_at.is_none();
            if first_read {
                artifact.first_read_at = Some(now);
                artifact.expires_at = artifact.expires_at.min(deadline(now, grace));
            }
            (artifact.clone(), first_read)
        };

        let file = match tokio::fs::File::open(&artifact.path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("Artifact {} is registered but unreadable: {}", id, e);
                self.evict(id).await;
                return Err(DownloadError::NotFound);
            }
        };

        if first_read {
            let store = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if store.evict(id).await {
                    debug!("Artifact {} removed after grace period", id);
                }
            });
        }

        Ok(ArtifactReader { artifact, file })
    }

    pub async fn get(&self, id: Uuid) -> Option<Artifact> {
        self.inner.registry.lock().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.registry.lock().await.len()
    }

    /// Removes the registry entry and its file. Returns false if the id was
    /// already gone.
    async fn evict(&self, id: Uuid) -> bool {
        let removed = self.inner.registry.lock().await.remove(&id);
        match removed {
            Some(artifact) => {
                delete_file(&artifact.path).await;
                true
            }
            None => false,
        }
    }

    /// Deletes every artifact whose deadline has passed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<Artifact> = {
            let mut registry = self.inner.registry.lock().await;
            let ids: Vec<Uuid> = registry
                .values()
                .filter(|a| a.is_expired(now))
                .map(|a| a.id)
                .collect();
            ids.iter().filter_map(|id| registry.remove(id)).collect()
        };

        for artifact in &expired {
            delete_file(&artifact.path).await;
        }
        expired.len()
    }

    pub fn spawn_sweeper(&self, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let removed = store.sweep(Utc::now()).await;
                        if removed > 0 {
                            info!("Sweep removed {} expired artifacts", removed);
                        }
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

async fn delete_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete {}: {}", path.display(), e),
    }
}

/// Only top-level files and the staging tree are removed, so a misconfigured
/// directory never loses nested user data.
async fn purge(root: &Path) -> anyhow::Result<usize> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(root).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let file_type = match entry.file_type().await {
            Ok(ft) => ft,
            Err(_) => continue,
        };

        if file_type.is_file() {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to purge {}: {}", path.display(), e),
            }
        } else if file_type.is_dir() && entry.file_name() == STAGING_DIR {
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to purge {}: {}", path.display(), e),
            }
        }
    }

    Ok(removed)
}
