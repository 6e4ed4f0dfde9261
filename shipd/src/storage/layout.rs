//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::dir::{Dir, Symlink};
use crate::filesys::file::File;
use crate::models::release::release_dir_name;

/// Storage layout for the orchestrator
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Directory holding one subdirectory per application
    pub apps_dir: PathBuf,

    /// Directory for process and deployment logs
    pub logs_dir: PathBuf,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(apps_dir: impl Into<PathBuf>, logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            apps_dir: apps_dir.into(),
            logs_dir: logs_dir.into(),
        }
    }

    /// Layout rooted at a single directory (`apps/` and `logs/` below it)
    pub fn rooted_at(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self::new(base_dir.join("apps"), base_dir.join("logs"))
    }

    pub fn apps_dir(&self) -> Dir {
        Dir::new(&self.apps_dir)
    }

    pub fn logs_dir(&self) -> Dir {
        Dir::new(&self.logs_dir)
    }

    /// Durable per-deployment log files
    pub fn deployment_logs_dir(&self) -> Dir {
        Dir::new(self.logs_dir.join("deployments"))
    }

    /// Layout of a single application
    pub fn app(&self, name: &str) -> AppLayout {
        AppLayout {
            app_dir: self.apps_dir.join(name),
        }
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), crate::errors::ShipError> {
        self.apps_dir().create().await?;
        self.logs_dir().create().await?;
        self.deployment_logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/shipd/apps", "/var/log/shipd")
    }
}

/// Paths belonging to one application
#[derive(Debug, Clone)]
pub struct AppLayout {
    pub app_dir: PathBuf,
}

impl AppLayout {
    pub fn dir(&self) -> Dir {
        Dir::new(&self.app_dir)
    }

    pub fn releases_dir(&self) -> Dir {
        Dir::new(self.app_dir.join("releases"))
    }

    /// `releases/v<id>/`
    pub fn release_dir(&self, id: u64) -> Dir {
        self.releases_dir().subdir(&release_dir_name(id))
    }

    /// `current` symlink to the live release
    pub fn current_link(&self) -> Symlink {
        Symlink::new(self.app_dir.join("current"))
    }

    /// `app.json`
    pub fn metadata_file(&self) -> File {
        File::new(self.app_dir.join("app.json"))
    }

    /// `.env.production`
    pub fn env_file(&self) -> File {
        File::new(self.app_dir.join(".env.production"))
    }
}
