//! In-memory RDS stand-in and request builders shared by the service tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use rds_client::error::{RdsError, Result};
use rds_client::ident::snapshot_slot_timestamp;
use rds_client::types::{
    CapacityInfo, DiskTraffic, RdsFile, RdsSnapshot, RdsVolume, VolumeStatus,
};
use rds_client::VolumeBackend;

use crate::csi;

/// Behaves like an RDS that always has a healthy pool unless told
/// otherwise: volumes format instantly, deletes are idempotent, snapshots
/// copy their source's size.
pub struct FakeBackend {
    volumes: Mutex<HashMap<String, RdsVolume>>,
    files: Mutex<HashMap<String, RdsFile>>,
    free_bytes: Mutex<u64>,
    calls: AtomicUsize,
    connected: Mutex<bool>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            volumes: Mutex::new(HashMap::new()),
            files: Mutex::new(HashMap::new()),
            free_bytes: Mutex::new(1 << 45),
            calls: AtomicUsize::new(0),
            connected: Mutex::new(true),
        }
    }
}

impl FakeBackend {
    pub fn set_free_bytes(&self, free: u64) {
        *self.free_bytes.lock().unwrap() = free;
    }

    pub fn set_connected(&self, connected: bool) {
        *self.connected.lock().unwrap() = connected;
    }

    pub fn volume_count(&self) -> usize {
        self.volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| !v.is_snapshot())
            .count()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn files_for_slot(&self, slot: &str) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.contains(slot))
            .cloned()
            .collect()
    }

    /// Seed a volume directly, bypassing create-side validation.
    pub fn insert_volume(&self, volume: RdsVolume) {
        let file = RdsFile {
            name: volume.file_path.trim_start_matches('/').to_string(),
            size_bytes: volume.size_bytes,
            creation_time: Some(UNIX_EPOCH),
        };
        self.files.lock().unwrap().insert(file.name.clone(), file);
        self.volumes
            .lock()
            .unwrap()
            .insert(volume.slot.clone(), volume);
    }

    fn tick(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !*self.connected.lock().unwrap() {
            return Err(RdsError::NotConnected);
        }
        Ok(())
    }

    fn file_name(volume_path: &str, slot: &str) -> String {
        format!(
            "{}/{}.img",
            volume_path.trim_matches('/').to_string(),
            slot
        )
    }

    fn add_entry(
        &self,
        slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
        exported: bool,
    ) -> Result<RdsVolume> {
        if self.volumes.lock().unwrap().contains_key(slot) {
            return Err(RdsError::AlreadyExists(slot.to_string()));
        }
        if size_bytes > *self.free_bytes.lock().unwrap() {
            return Err(RdsError::OutOfSpace("failure: not enough space".to_string()));
        }

        let file_name = Self::file_name(volume_path, slot);
        let volume = RdsVolume {
            slot: slot.to_string(),
            file_path: format!("/{}", file_name),
            size_bytes,
            nvme_export: exported,
            nvme_port,
            nqn: nqn.to_string(),
            status: VolumeStatus::Ready,
        };
        self.files.lock().unwrap().insert(
            file_name.clone(),
            RdsFile {
                name: file_name,
                size_bytes,
                creation_time: Some(UNIX_EPOCH),
            },
        );
        self.volumes
            .lock()
            .unwrap()
            .insert(slot.to_string(), volume.clone());
        Ok(volume)
    }
}

#[async_trait]
impl VolumeBackend for FakeBackend {
    async fn create_volume(
        &self,
        slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<RdsVolume> {
        self.tick()?;
        self.add_entry(slot, volume_path, size_bytes, nvme_port, nqn, true)
    }

    async fn get_volume(&self, slot: &str) -> Result<RdsVolume> {
        self.tick()?;
        self.volumes
            .lock()
            .unwrap()
            .get(slot)
            .cloned()
            .ok_or_else(|| RdsError::VolumeNotFound(slot.to_string()))
    }

    async fn delete_volume(&self, slot: &str, volume_path: &str) -> Result<()> {
        self.tick()?;
        self.volumes.lock().unwrap().remove(slot);
        self.files
            .lock()
            .unwrap()
            .remove(&Self::file_name(volume_path, slot));
        Ok(())
    }

    async fn resize_volume(&self, slot: &str, new_size_bytes: u64) -> Result<u64> {
        self.tick()?;
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get_mut(slot)
            .ok_or_else(|| RdsError::VolumeNotFound(slot.to_string()))?;
        if new_size_bytes < volume.size_bytes {
            return Err(RdsError::InvalidArgument(format!(
                "shrink from {} to {} bytes is not supported",
                volume.size_bytes, new_size_bytes
            )));
        }
        volume.size_bytes = new_size_bytes;
        Ok(volume.size_bytes)
    }

    async fn list_volumes(&self, slot_prefix: &str) -> Result<Vec<RdsVolume>> {
        self.tick()?;
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.slot.starts_with(slot_prefix))
            .cloned()
            .collect())
    }

    async fn create_snapshot(
        &self,
        snap_slot: &str,
        source_slot: &str,
        volume_path: &str,
    ) -> Result<RdsSnapshot> {
        self.tick()?;
        let size_bytes = self
            .volumes
            .lock()
            .unwrap()
            .get(source_slot)
            .map(|v| v.size_bytes)
            .ok_or_else(|| RdsError::VolumeNotFound(source_slot.to_string()))?;

        let volume = self.add_entry(snap_slot, volume_path, size_bytes, 0, "", false)?;
        Ok(RdsSnapshot {
            slot: volume.slot,
            file_path: volume.file_path,
            size_bytes,
            source_slot: Some(source_slot.to_string()),
            created_at: snapshot_slot_timestamp(snap_slot)
                .map(|ts| UNIX_EPOCH + Duration::from_secs(ts)),
        })
    }

    async fn get_snapshot(&self, snap_slot: &str) -> Result<RdsSnapshot> {
        self.tick()?;
        let volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .get(snap_slot)
            .ok_or_else(|| RdsError::SnapshotNotFound(snap_slot.to_string()))?;
        Ok(RdsSnapshot {
            slot: volume.slot.clone(),
            file_path: volume.file_path.clone(),
            size_bytes: volume.size_bytes,
            source_slot: None,
            created_at: snapshot_slot_timestamp(snap_slot)
                .map(|ts| UNIX_EPOCH + Duration::from_secs(ts)),
        })
    }

    async fn delete_snapshot(&self, snap_slot: &str, volume_path: &str) -> Result<()> {
        self.tick()?;
        self.volumes.lock().unwrap().remove(snap_slot);
        self.files
            .lock()
            .unwrap()
            .remove(&Self::file_name(volume_path, snap_slot));
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<RdsSnapshot>> {
        self.tick()?;
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .values()
            .filter(|v| v.is_snapshot())
            .map(|v| RdsSnapshot {
                slot: v.slot.clone(),
                file_path: v.file_path.clone(),
                size_bytes: v.size_bytes,
                source_slot: None,
                created_at: snapshot_slot_timestamp(&v.slot)
                    .map(|ts| UNIX_EPOCH + Duration::from_secs(ts)),
            })
            .collect())
    }

    async fn restore_volume(
        &self,
        slot: &str,
        snap_slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<RdsVolume> {
        self.tick()?;
        if !self.volumes.lock().unwrap().contains_key(snap_slot) {
            return Err(RdsError::SnapshotNotFound(snap_slot.to_string()));
        }
        self.add_entry(slot, volume_path, size_bytes, nvme_port, nqn, true)
    }

    async fn get_capacity(&self, _volume_path: &str) -> Result<CapacityInfo> {
        self.tick()?;
        let free = *self.free_bytes.lock().unwrap();
        Ok(CapacityInfo {
            total_bytes: free * 2,
            free_bytes: free,
            observed_at: SystemTime::now(),
        })
    }

    async fn list_files(&self, _volume_path: &str) -> Result<Vec<RdsFile>> {
        self.tick()?;
        Ok(self.files.lock().unwrap().values().cloned().collect())
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        self.tick()?;
        self.files.lock().unwrap().remove(name.trim_start_matches('/'));
        Ok(())
    }

    async fn disk_traffic(&self, _slot: &str) -> Result<DiskTraffic> {
        self.tick()?;
        Ok(DiskTraffic {
            read_bytes_per_sec: 1_000,
            write_bytes_per_sec: 2_000,
        })
    }
}

pub fn mount_capability(fs_type: &str, multi_node: bool) -> csi::VolumeCapability {
    use csi::volume_capability::access_mode::Mode;
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume {
                fs_type: fs_type.to_string(),
                mount_flags: vec![],
                volume_mount_group: String::new(),
            },
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: if multi_node {
                Mode::MultiNodeMultiWriter as i32
            } else {
                Mode::SingleNodeWriter as i32
            },
        }),
    }
}

pub fn block_capability(multi_node: bool) -> csi::VolumeCapability {
    use csi::volume_capability::access_mode::Mode;
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Block(
            csi::volume_capability::BlockVolume {},
        )),
        access_mode: Some(csi::volume_capability::AccessMode {
            mode: if multi_node {
                Mode::MultiNodeMultiWriter as i32
            } else {
                Mode::SingleNodeWriter as i32
            },
        }),
    }
}
