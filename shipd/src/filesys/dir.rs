//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::ShipError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ShipError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), ShipError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, ShipError> {
        let mut dirs = Vec::new();
        if !self.exists().await {
            return Ok(dirs);
        }
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        dirs.sort();
        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Return the first of `names` that exists as a file in this directory
    pub async fn find_first(&self, names: &[&str]) -> Option<File> {
        for name in names {
            let file = self.file(name);
            if file.is_file().await {
                return Some(file);
            }
        }
        None
    }
}

/// A symbolic link that always points at a directory.
///
/// Switching the target goes through a temporary link followed by a rename,
/// so readers observe either the old or the new target, never a missing link.
#[derive(Debug, Clone)]
pub struct Symlink {
    path: PathBuf,
}

impl Symlink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve the current target, if the link exists
    pub async fn target(&self) -> Option<PathBuf> {
        fs::read_link(&self.path).await.ok()
    }

    /// Atomically point the link at `target`
    pub async fn switch_to(&self, target: &Path) -> Result<(), ShipError> {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "link".to_string());
        let temp_path = self
            .path
            .with_file_name(format!(".{}.{}", file_name, uuid::Uuid::new_v4().simple()));

        let target = target.to_path_buf();
        let link = temp_path.clone();
        tokio::task::spawn_blocking(move || create_symlink(&target, &link))
            .await
            .map_err(|e| ShipError::Internal(format!("symlink task failed: {}", e)))??;

        if let Err(e) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Remove the link (not its target)
    pub async fn remove(&self) -> Result<(), ShipError> {
        if fs::symlink_metadata(&self.path).await.is_ok() {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn create_symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}
