//! Release & version store
//!
//! Owns `app.json` and the `releases/` tree of every application. Each
//! mutation is a locked read-modify-write that is persisted before the call
//! returns, so a crash mid-deployment leaves a consistent history behind.

use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::locks::KeyedLocks;
use crate::deploy::fsm::can_transition;
use crate::deploy::strategy::{resolve_deploy_strategy, DeployStrategy};
use crate::errors::ShipError;
use crate::models::app::AppMetadata;
use crate::models::release::{ImageRelease, Release, ReleaseStatus};
use crate::storage::layout::{AppLayout, StorageLayout};
use crate::utils::is_valid_app_name;

/// A freshly allocated release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedVersion {
    pub id: u64,
    pub release_dir: PathBuf,
}

/// Read-only view of an application's history
#[derive(Debug, Clone, Serialize)]
pub struct VersionsView {
    pub app: String,
    pub strategy: DeployStrategy,
    pub current_version_id: Option<u64>,
    /// Newest first
    pub versions: Vec<Release>,
    pub current_image_release_id: Option<u64>,
    /// Newest first
    pub image_releases: Vec<ImageRelease>,
}

/// Release & version store
#[derive(Debug)]
pub struct VersionStore {
    layout: StorageLayout,
    locks: KeyedLocks,
}

impl VersionStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self {
            layout,
            locks: KeyedLocks::new(),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn app_layout(&self, app: &str) -> AppLayout {
        self.layout.app(app)
    }

    fn check_name(app: &str) -> Result<(), ShipError> {
        if is_valid_app_name(app) {
            Ok(())
        } else {
            Err(ShipError::ValidationError(format!(
                "Invalid application name '{}': use lowercase letters, digits, '-' and '_'",
                app
            )))
        }
    }

    /// Load an application's metadata
    pub async fn load(&self, app: &str) -> Result<AppMetadata, ShipError> {
        Self::check_name(app)?;
        let file = self.app_layout(app).metadata_file();
        if !file.exists().await {
            return Err(ShipError::NotFound(format!("Application '{}' not found", app)));
        }
        file.read_json().await
    }

    async fn load_or_create(&self, app: &str) -> Result<AppMetadata, ShipError> {
        match self.load(app).await {
            Ok(metadata) => Ok(metadata),
            Err(ShipError::NotFound(_)) => Ok(AppMetadata::new(app)),
            Err(e) => Err(e),
        }
    }

    /// Locked read-modify-write of an application's metadata.
    ///
    /// The application is registered on first use. Nothing is written when
    /// `f` fails.
    pub async fn update<T, F>(&self, app: &str, f: F) -> Result<T, ShipError>
    where
        F: FnOnce(&mut AppMetadata) -> Result<T, ShipError>,
    {
        Self::check_name(app)?;
        let _guard = self.locks.lock(app).await;
        let mut metadata = self.load_or_create(app).await?;
        let value = f(&mut metadata)?;
        metadata.touch();
        self.app_layout(app).metadata_file().write_json(&metadata).await?;
        Ok(value)
    }

    /// All registered applications
    pub async fn list_apps(&self) -> Result<Vec<AppMetadata>, ShipError> {
        let mut apps = Vec::new();
        for dir in self.layout.apps_dir().list_dirs().await? {
            let Some(name) = dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if !is_valid_app_name(&name) {
                continue;
            }
            match self.load(&name).await {
                Ok(metadata) => apps.push(metadata),
                Err(ShipError::NotFound(_)) => {}
                Err(e) => warn!("Skipping application {}: unreadable metadata: {}", name, e),
            }
        }
        Ok(apps)
    }

    /// Allocate the next release id, create its empty directory and persist
    /// a `pending` entry.
    pub async fn create_version(
        &self,
        app: &str,
        commit: &str,
        branch: &str,
    ) -> Result<CreatedVersion, ShipError> {
        let layout = self.app_layout(app);
        let created = self
            .update(app, |metadata| {
                let id = metadata.next_version_id();
                metadata.versions.push(Release {
                    id,
                    commit: commit.to_string(),
                    branch: branch.to_string(),
                    timestamp: Utc::now(),
                    status: ReleaseStatus::Pending,
                    message: None,
                });
                metadata.last_version_id = id;
                Ok(CreatedVersion {
                    id,
                    release_dir: layout.release_dir(id).path().to_path_buf(),
                })
            })
            .await?;

        let dir = layout.release_dir(created.id);
        // Leftover from a crashed attempt with the same id
        dir.delete().await?;
        dir.create().await?;

        info!(app, version = created.id, commit, branch, "Created release");
        Ok(created)
    }

    /// Move a release to `status`, rejecting backward transitions
    pub async fn update_version_status(
        &self,
        app: &str,
        id: u64,
        status: ReleaseStatus,
        message: Option<String>,
    ) -> Result<(), ShipError> {
        self.update(app, |metadata| {
            let release = metadata
                .version_mut(id)
                .ok_or_else(|| ShipError::NotFound(format!("Version {} of '{}' not found", id, app)))?;
            if !can_transition(release.status, status) {
                return Err(ShipError::ValidationError(format!(
                    "Version {} cannot move from {} to {}",
                    id, release.status, status
                )));
            }
            release.status = status;
            if message.is_some() {
                release.message = message;
            }
            Ok(())
        })
        .await?;
        debug!(app, version = id, %status, "Updated release status");
        Ok(())
    }

    /// Point `current` at release `id`.
    ///
    /// Returns `false` without touching anything when the release or its
    /// directory is missing. On success the release becomes `active` and the
    /// previously current release becomes `success`, in the same write that
    /// moves the pointer.
    pub async fn set_current_version(&self, app: &str, id: u64) -> Result<bool, ShipError> {
        let layout = self.app_layout(app);
        let release_dir = layout.release_dir(id);
        if !release_dir.exists().await {
            warn!(app, version = id, "Cannot switch current: release directory missing");
            return Ok(false);
        }

        let metadata = self.load(app).await?;
        let Some(release) = metadata.version(id) else {
            warn!(app, version = id, "Cannot switch current: version not in history");
            return Ok(false);
        };
        if !can_transition(release.status, ReleaseStatus::Active) {
            return Err(ShipError::ValidationError(format!(
                "Version {} is {} and cannot become current",
                id, release.status
            )));
        }

        layout.current_link().switch_to(release_dir.path()).await?;

        self.update(app, |metadata| {
            let previous = metadata.current_version_id.filter(|prev| *prev != id);
            if let Some(prev) = previous.and_then(|prev| metadata.version_mut(prev)) {
                if prev.status == ReleaseStatus::Active {
                    prev.status = ReleaseStatus::Success;
                }
            }
            if let Some(release) = metadata.version_mut(id) {
                release.status = ReleaseStatus::Active;
            }
            metadata.current_version_id = Some(id);
            Ok(())
        })
        .await?;

        info!(app, version = id, "Switched current release");
        Ok(true)
    }

    /// Delete a release directory and its history entry
    pub async fn remove_version(&self, app: &str, id: u64) -> Result<(), ShipError> {
        self.update(app, |metadata| {
            if metadata.current_version_id == Some(id) {
                return Err(ShipError::ValidationError(format!(
                    "Version {} is current and cannot be removed",
                    id
                )));
            }
            metadata.versions.retain(|v| v.id != id);
            Ok(())
        })
        .await?;

        self.app_layout(app).release_dir(id).delete().await?;
        info!(app, version = id, "Removed release");
        Ok(())
    }

    /// Apply the retention policy and return the removed release ids.
    ///
    /// Keeps the current release plus the newest `keep` successful ones.
    /// Failed releases older than the oldest retained successful release are
    /// removed; with no successful release at all, the newest `keep` failed
    /// releases are kept instead. In-flight releases are never touched.
    pub async fn clean_old_versions(&self, app: &str, keep: usize) -> Result<Vec<u64>, ShipError> {
        let removed = self
            .update(app, |metadata| {
                let removed = select_expired_versions(metadata, keep);
                metadata.versions.retain(|v| !removed.contains(&v.id));
                Ok(removed)
            })
            .await?;

        let layout = self.app_layout(app);
        for id in &removed {
            if let Err(e) = layout.release_dir(*id).delete().await {
                warn!(app, version = id, "Failed to delete expired release directory: {}", e);
            }
        }
        if !removed.is_empty() {
            info!(app, removed = ?removed, "Cleaned old releases");
        }
        Ok(removed)
    }

    /// History view for operators
    pub async fn list_versions(&self, app: &str) -> Result<VersionsView, ShipError> {
        let metadata = self.load(app).await?;
        Ok(VersionsView {
            app: metadata.name.clone(),
            strategy: resolve_deploy_strategy(&metadata),
            current_version_id: metadata.current_version_id,
            versions: metadata.versions.iter().rev().cloned().collect(),
            current_image_release_id: metadata.current_image_release_id,
            image_releases: metadata.image_releases.iter().rev().cloned().collect(),
        })
    }

    /// Remove an application's directory and metadata
    pub async fn delete_app(&self, app: &str) -> Result<(), ShipError> {
        Self::check_name(app)?;
        let _guard = self.locks.lock(app).await;
        self.app_layout(app).dir().delete().await?;
        info!(app, "Deleted application data");
        Ok(())
    }
}

/// Release ids the retention policy would remove
pub fn select_expired_versions(metadata: &AppMetadata, keep: usize) -> Vec<u64> {
    let current = metadata.current_version_id;

    let mut successes: Vec<u64> = metadata
        .versions
        .iter()
        .filter(|v| v.status.is_deployable() && Some(v.id) != current)
        .map(|v| v.id)
        .collect();
    successes.sort_unstable_by(|a, b| b.cmp(a));

    let retained: Vec<u64> = successes.iter().take(keep).copied().collect();
    let mut removed: Vec<u64> = successes.iter().skip(keep).copied().collect();

    let mut failed: Vec<u64> = metadata
        .versions
        .iter()
        .filter(|v| v.status == ReleaseStatus::Failed)
        .map(|v| v.id)
        .collect();
    failed.sort_unstable_by(|a, b| b.cmp(a));

    let oldest_retained = retained.iter().copied().chain(current).min();
    match oldest_retained {
        Some(oldest) => removed.extend(failed.into_iter().filter(|id| *id < oldest)),
        None => removed.extend(failed.into_iter().skip(keep)),
    }

    removed.sort_unstable();
    removed
}
