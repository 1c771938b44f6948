//! Device state storage in a JSON file
//!
//! Mutations only mark the store dirty. A single saver task writes the
//! current contents of the device table, so bursts of changes coalesce and
//! the file never ends up older than the last completed write.

use crate::device::{Device, DeviceId};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};

/// Load devices from a JSON file. A missing or unreadable file yields none.
pub async fn load_devices(path: &Path) -> Vec<Device> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No devices file at {:?}, starting empty", path);
            return Vec::new();
        }
        Err(e) => {
            tracing::warn!("Failed to read devices file {:?}: {}", path, e);
            return Vec::new();
        }
    };

    match serde_json::from_str::<Vec<Device>>(&contents) {
        Ok(devices) => {
            tracing::info!("Restored {} devices from {:?}", devices.len(), path);
            devices
        }
        Err(e) => {
            tracing::warn!("Ignoring corrupt devices file {:?}: {}", path, e);
            Vec::new()
        }
    }
}

/// Background writer for the device table
pub(crate) struct DeviceStore {
    path: PathBuf,
    devices: Arc<DashMap<DeviceId, Device>>,
    dirty: watch::Sender<()>,
    /// Held for the whole snapshot-and-write so writes never interleave
    write_lock: Arc<Mutex<()>>,
}

impl DeviceStore {
    /// Start the saver task for `devices`
    pub(crate) fn spawn(path: PathBuf, devices: Arc<DashMap<DeviceId, Device>>) -> Self {
        let (dirty, mut dirty_rx) = watch::channel(());
        let write_lock = Arc::new(Mutex::new(()));

        let saver_path = path.clone();
        let saver_devices = Arc::clone(&devices);
        let saver_lock = Arc::clone(&write_lock);
        tokio::spawn(async move {
            // Ends once the store is dropped and the last change is written
            while dirty_rx.changed().await.is_ok() {
                let _guard = saver_lock.lock().await;
                if let Err(e) = write_snapshot(&saver_path, &saver_devices).await {
                    tracing::warn!("Failed to save devices to {:?}: {}", saver_path, e);
                }
            }
        });

        Self {
            path,
            devices,
            dirty,
            write_lock,
        }
    }

    /// Schedule a write of the current device table
    pub(crate) fn mark_dirty(&self) {
        self.dirty.send_replace(());
    }

    /// Write the current device table and wait for it to reach the disk
    pub(crate) async fn flush(&self) -> Result<(), std::io::Error> {
        let _guard = self.write_lock.lock().await;
        write_snapshot(&self.path, &self.devices).await
    }
}

/// Write every device, ordered by id, through a synced temp file
async fn write_snapshot(
    path: &Path,
    devices: &DashMap<DeviceId, Device>,
) -> Result<(), std::io::Error> {
    let mut snapshot: Vec<Device> = devices.iter().map(|r| r.value().clone()).collect();
    snapshot.sort_by(|a, b| a.id.cmp(&b.id));

    let json = serde_json::to_vec_pretty(&snapshot)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let mut file = fs::File::create(&tmp_path).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp_path, path).await?;

    tracing::debug!("Saved {} devices to {:?}", snapshot.len(), path);
    Ok(())
}
