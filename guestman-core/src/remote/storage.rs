//! Disk storage interface.
//!
//! Guests only see disks through [`StorageManager`]. The local implementation
//! keeps qcow2/raw files under a storage root and drives `qemu-img`.

use crate::command;
use crate::error::{GuestError, Result};
use crate::types::{DiskDesc, DiskFormat};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

#[async_trait]
pub trait StorageManager: Send + Sync {
    /// Resolve where a disk's image lives.
    fn disk_path(&self, disk: &DiskDesc) -> PathBuf;

    /// Where snapshot `snapshot_id` of `disk` is kept.
    fn snapshot_path(&self, disk: &DiskDesc, snapshot_id: &str) -> PathBuf;

    /// Create the image of `disk`, optionally on top of a backing image.
    async fn create_disk(&self, disk: &DiskDesc, backing: Option<&Path>) -> Result<PathBuf>;

    async fn delete_disk(&self, disk: &DiskDesc) -> Result<()>;

    /// Freeze the current image as snapshot `snapshot_id` and continue on a
    /// fresh overlay at the same path. Returns the snapshot location.
    async fn create_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf>;

    /// Remove a snapshot. With `flatten`, the overlay first absorbs the
    /// snapshot's data so the chain stays readable.
    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, flatten: bool) -> Result<()>;

    /// Replace the current overlay with a fresh one on top of `snapshot_id`.
    async fn reset_disk(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf>;

    /// Backing reference the destination host needs to rebuild this disk.
    async fn prepare_migrate(&self, disk: &DiskDesc) -> Result<Option<String>>;

    /// Download a disk image exported by the source host.
    async fn fetch_snapshot(&self, url: &str, target: &Path) -> Result<()>;

    async fn resize_disk(&self, disk: &DiskDesc, size_mb: u64) -> Result<()>;
}

/// File-backed storage driven by `qemu-img`.
#[derive(Debug, Clone)]
pub struct LocalStorageManager {
    root: PathBuf,
    qemu_img: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct ImageInfo {
    #[serde(default, rename = "backing-filename")]
    backing_filename: Option<String>,
}

impl LocalStorageManager {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(3600))
            .build()
            .map_err(|e| GuestError::InvalidConfig {
                reason: format!("Failed to create HTTP client: {}", e),
            })?;
        Ok(Self { root: root.into(), qemu_img: "qemu-img".to_string(), client })
    }

    pub fn with_qemu_img(mut self, qemu_img: impl Into<String>) -> Self {
        self.qemu_img = qemu_img.into();
        self
    }

    fn snapshot_dir(&self, disk: &DiskDesc) -> PathBuf {
        let path = self.disk_path(disk);
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        path.with_file_name(format!("{}.snapshots", name))
    }

    async fn qemu_img(&self, args: &[&str]) -> Result<String> {
        command::run(&self.qemu_img, args).await.map_err(|e| GuestError::Storage { reason: e.to_string() })
    }

    async fn create_overlay(&self, path: &Path, backing: &Path) -> Result<()> {
        let path = path.to_string_lossy();
        let backing = backing.to_string_lossy();
        self.qemu_img(&["create", "-f", "qcow2", "-b", backing.as_ref(), "-F", "qcow2", path.as_ref()])
            .await
            .map(|_| ())
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| GuestError::io(parent, e))?;
    }
    Ok(())
}

#[async_trait]
impl StorageManager for LocalStorageManager {
    fn disk_path(&self, disk: &DiskDesc) -> PathBuf {
        if disk.path.as_os_str().is_empty() {
            self.root.join(&disk.disk_id)
        } else {
            disk.path.clone()
        }
    }

    fn snapshot_path(&self, disk: &DiskDesc, snapshot_id: &str) -> PathBuf {
        self.snapshot_dir(disk).join(snapshot_id)
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn create_disk(&self, disk: &DiskDesc, backing: Option<&Path>) -> Result<PathBuf> {
        let path = self.disk_path(disk);
        ensure_parent(&path).await?;
        match backing {
            Some(backing) => self.create_overlay(&path, backing).await?,
            None => {
                let size = format!("{}M", disk.size);
                let target = path.to_string_lossy();
                self.qemu_img(&["create", "-f", disk.format.as_str(), target.as_ref(), &size]).await?;
            }
        }
        info!(path = %path.display(), "Created disk");
        Ok(path)
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn delete_disk(&self, disk: &DiskDesc) -> Result<()> {
        let path = self.disk_path(disk);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Disk already gone");
            }
            Err(e) => return Err(GuestError::io(path, e)),
        }
        let snapshots = self.snapshot_dir(disk);
        if snapshots.exists() {
            tokio::fs::remove_dir_all(&snapshots).await.map_err(|e| GuestError::io(&snapshots, e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn create_snapshot(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf> {
        if disk.format != DiskFormat::Qcow2 {
            return Err(GuestError::Unsupported {
                operation: "snapshot".to_string(),
                reason: format!("disk {} is not qcow2", disk.disk_id),
            });
        }
        let path = self.disk_path(disk);
        let snapshot = self.snapshot_path(disk, snapshot_id);
        if snapshot.exists() {
            return Err(GuestError::BadRequest { reason: format!("snapshot {} exists", snapshot_id) });
        }
        ensure_parent(&snapshot).await?;
        tokio::fs::rename(&path, &snapshot).await.map_err(|e| GuestError::io(&path, e))?;
        if let Err(e) = self.create_overlay(&path, &snapshot).await {
            // put the original image back so the guest keeps its disk
            if let Err(undo) = tokio::fs::rename(&snapshot, &path).await {
                warn!(error = %undo, "Failed to restore disk after snapshot failure");
            }
            return Err(e);
        }
        info!(snapshot = %snapshot.display(), "Created snapshot");
        Ok(snapshot)
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn delete_snapshot(&self, disk: &DiskDesc, snapshot_id: &str, flatten: bool) -> Result<()> {
        let snapshot = self.snapshot_path(disk, snapshot_id);
        if !snapshot.exists() {
            return Err(GuestError::NotFound { resource: "snapshot", id: snapshot_id.to_string() });
        }
        if flatten {
            let path = self.disk_path(disk);
            let path = path.to_string_lossy();
            self.qemu_img(&["rebase", "-f", "qcow2", "-b", "", path.as_ref()]).await?;
        }
        tokio::fs::remove_file(&snapshot).await.map_err(|e| GuestError::io(&snapshot, e))?;
        info!(snapshot_id, "Deleted snapshot");
        Ok(())
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn reset_disk(&self, disk: &DiskDesc, snapshot_id: &str) -> Result<PathBuf> {
        let snapshot = self.snapshot_path(disk, snapshot_id);
        if !snapshot.exists() {
            return Err(GuestError::NotFound { resource: "snapshot", id: snapshot_id.to_string() });
        }
        let path = self.disk_path(disk);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(GuestError::io(&path, e)),
        }
        self.create_overlay(&path, &snapshot).await?;
        Ok(path)
    }

    async fn prepare_migrate(&self, disk: &DiskDesc) -> Result<Option<String>> {
        let path = self.disk_path(disk);
        let target = path.to_string_lossy();
        let out = self.qemu_img(&["info", "--output=json", target.as_ref()]).await?;
        let info: ImageInfo = serde_json::from_str(&out)
            .map_err(|e| GuestError::Storage { reason: format!("bad qemu-img info output: {}", e) })?;
        Ok(info.backing_filename)
    }

    #[instrument(skip(self))]
    async fn fetch_snapshot(&self, url: &str, target: &Path) -> Result<()> {
        ensure_parent(target).await?;
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GuestError::Storage { reason: format!("fetch {}: {}", url, e) })?;
        let mut file = tokio::fs::File::create(target).await.map_err(|e| GuestError::io(target, e))?;
        let mut received: u64 = 0;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| GuestError::Storage { reason: format!("fetch {}: {}", url, e) })?
        {
            received += chunk.len() as u64;
            file.write_all(&chunk).await.map_err(|e| GuestError::io(target, e))?;
        }
        file.flush().await.map_err(|e| GuestError::io(target, e))?;
        info!(bytes = received, target = %target.display(), "Fetched disk image");
        Ok(())
    }

    #[instrument(skip(self, disk), fields(disk_id = %disk.disk_id))]
    async fn resize_disk(&self, disk: &DiskDesc, size_mb: u64) -> Result<()> {
        let path = self.disk_path(disk);
        let target = path.to_string_lossy();
        let size = format!("{}M", size_mb);
        self.qemu_img(&["resize", target.as_ref(), &size]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_disk_path_falls_back_to_root() {
        let storage = LocalStorageManager::new("/data/disks").unwrap();
        let mut disk = DiskDesc::new("d1", 0);
        assert_eq!(storage.disk_path(&disk), PathBuf::from("/data/disks/d1"));
        disk.path = PathBuf::from("/other/img");
        assert_eq!(storage.disk_path(&disk), PathBuf::from("/other/img"));
        assert_eq!(storage.snapshot_path(&disk, "s1"), PathBuf::from("/other/img.snapshots/s1"));
    }

    #[tokio::test]
    async fn test_delete_missing_disk_is_ok() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorageManager::new(tmp.path()).unwrap();
        storage.delete_disk(&DiskDesc::new("gone", 0)).await.unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_rejects_raw_disk() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorageManager::new(tmp.path()).unwrap();
        let mut disk = DiskDesc::new("d1", 0);
        disk.format = DiskFormat::Raw;
        let err = storage.create_snapshot(&disk, "s1").await.unwrap_err();
        assert!(matches!(err, GuestError::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_snapshot_restores_image_when_overlay_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = LocalStorageManager::new(tmp.path()).unwrap().with_qemu_img("/bin/false");
        let disk = DiskDesc::new("d1", 0);
        std::fs::write(tmp.path().join("d1"), b"image").unwrap();
        assert!(storage.create_snapshot(&disk, "s1").await.is_err());
        assert_eq!(std::fs::read(tmp.path().join("d1")).unwrap(), b"image");
    }
}
