//! Typed volume/snapshot/file/capacity API over the RDS CLI.
//!
//! Every operation validates its inputs before a single byte of command
//! string is formatted, runs the command through the shared transport, and
//! parses the semi-structured reply into the types in [`crate::types`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RdsError, Result};
use crate::ident::{
    self, PathValidator, SNAPSHOT_PREFIX, validate_nqn, validate_port, validate_slot,
    validate_snapshot_slot,
};
use crate::parse;
use crate::transport::{SshTransport, classify_output_error};
use crate::types::{CapacityInfo, DiskTraffic, RdsFile, RdsSnapshot, RdsVolume, VolumeStatus};

/// How many times a transient transport failure is retried per command.
const DEFAULT_MAX_RETRIES: u32 = 3;
/// Attempts (1s apart) waiting for a freshly created volume to go `ready`.
const READY_POLL_ATTEMPTS: u32 = 30;

/// The storage-backend seam. The controller and reconciler are written
/// against this trait; production wires in [`RdsClient`], tests an
/// in-memory fake.
#[async_trait]
pub trait VolumeBackend: Send + Sync {
    async fn create_volume(
        &self,
        slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<RdsVolume>;

    async fn get_volume(&self, slot: &str) -> Result<RdsVolume>;

    /// Remove the disk entry and its backing file. Success when already
    /// absent.
    async fn delete_volume(&self, slot: &str, volume_path: &str) -> Result<()>;

    /// Grow the volume. Shrink requests and no-ops are decided here so every
    /// caller shares the same semantics.
    async fn resize_volume(&self, slot: &str, new_size_bytes: u64) -> Result<u64>;

    async fn list_volumes(&self, slot_prefix: &str) -> Result<Vec<RdsVolume>>;

    async fn create_snapshot(
        &self,
        snap_slot: &str,
        source_slot: &str,
        volume_path: &str,
    ) -> Result<RdsSnapshot>;

    async fn get_snapshot(&self, snap_slot: &str) -> Result<RdsSnapshot>;

    async fn delete_snapshot(&self, snap_slot: &str, volume_path: &str) -> Result<()>;

    async fn list_snapshots(&self) -> Result<Vec<RdsSnapshot>>;

    /// Create a new writable, NVMe-exported volume from a snapshot.
    async fn restore_volume(
        &self,
        slot: &str,
        snap_slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<RdsVolume>;

    async fn get_capacity(&self, volume_path: &str) -> Result<CapacityInfo>;

    async fn list_files(&self, volume_path: &str) -> Result<Vec<RdsFile>>;

    /// Remove a backing file with no disk entry (orphan cleanup).
    async fn delete_file(&self, name: &str) -> Result<()>;

    async fn disk_traffic(&self, slot: &str) -> Result<DiskTraffic>;
}

/// Production backend speaking the RDS CLI over SSH.
pub struct RdsClient {
    transport: Arc<Mutex<SshTransport>>,
    paths: PathValidator,
    max_retries: u32,
}

impl RdsClient {
    pub fn new(transport: Arc<Mutex<SshTransport>>, allowed_base_paths: Vec<PathBuf>) -> Result<Self> {
        Ok(Self {
            transport,
            paths: PathValidator::new(allowed_base_paths)?,
            max_retries: DEFAULT_MAX_RETRIES,
        })
    }

    pub fn transport(&self) -> Arc<Mutex<SshTransport>> {
        self.transport.clone()
    }

    /// Backing file path for a slot under a validated base directory.
    pub fn backing_file_path(volume_path: &str, slot: &str) -> String {
        format!("{}/{}.img", volume_path.trim_end_matches('/'), slot)
    }

    /// RDS file names drop the leading slash.
    fn file_name_for(path: &str) -> &str {
        path.trim_start_matches('/')
    }

    async fn run(&self, cmd: &str) -> Result<String> {
        let mut transport = self.transport.lock().await;
        let context = cmd.split_whitespace().next().unwrap_or(cmd).to_string();
        transport
            .run_command_with_retry(cmd, self.max_retries)
            .map_err(|e| match e {
                // Refine raw command rejections into the typed taxonomy the
                // service layer maps to CSI codes.
                RdsError::CommandFailed(msg) => classify_output_error(&context, &msg),
                other => other,
            })
    }

    fn validate_volume_args(
        &self,
        slot: &str,
        volume_path: &str,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<String> {
        validate_slot(slot)?;
        self.paths.validate(volume_path)?;
        validate_port(nvme_port as u32, false)?;
        validate_nqn(nqn)?;
        let file_path = Self::backing_file_path(volume_path, slot);
        self.paths.validate(&file_path)?;
        Ok(file_path)
    }

    fn volume_from_record(record: &parse::Record) -> Result<RdsVolume> {
        let slot = record
            .get("slot")
            .ok_or_else(|| RdsError::Parse("disk entry without slot".to_string()))?
            .clone();
        let file_path = record
            .get("file-path")
            .or_else(|| record.get("file"))
            .cloned()
            .unwrap_or_default();
        let size_bytes = match record.get("file-size").or_else(|| record.get("size")) {
            Some(raw) => parse::parse_size(raw)?,
            None => 0,
        };
        let nvme_export = record
            .get("nvme-tcp-export")
            .map(|v| v == "yes")
            .unwrap_or(false);
        let nvme_port = record
            .get("nvme-tcp-server-port")
            .map(|v| v.parse().map_err(|_| RdsError::Parse(format!("bad port '{}'", v))))
            .transpose()?
            .unwrap_or(0);
        let nqn = record.get("nvme-tcp-server-nqn").cloned().unwrap_or_default();
        let status = record
            .get("status")
            .map(|s| VolumeStatus::parse(s))
            .unwrap_or(VolumeStatus::Unknown);

        Ok(RdsVolume {
            slot,
            file_path,
            size_bytes,
            nvme_export,
            nvme_port,
            nqn,
            status,
        })
    }

    fn snapshot_from_volume(volume: RdsVolume) -> RdsSnapshot {
        let created_at = ident::snapshot_slot_timestamp(&volume.slot)
            .map(|ts| UNIX_EPOCH + Duration::from_secs(ts));
        RdsSnapshot {
            slot: volume.slot,
            file_path: volume.file_path,
            size_bytes: volume.size_bytes,
            source_slot: None,
            created_at,
        }
    }

    /// "no such item" from a remove command means the target is already
    /// gone, which is what the caller wanted.
    fn absorb_missing(result: Result<String>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(RdsError::CommandFailed(msg)) if msg.to_lowercase().contains("no such item") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_until_ready(&self, slot: &str) -> Result<RdsVolume> {
        for attempt in 0..READY_POLL_ATTEMPTS {
            let volume = self.fetch_volume(slot).await?;
            match volume.status {
                VolumeStatus::Ready => return Ok(volume),
                VolumeStatus::Formatting | VolumeStatus::Unknown => {
                    debug!(slot = %slot, attempt = attempt, status = %volume.status, "Waiting for volume to become ready");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                VolumeStatus::Error => {
                    return Err(RdsError::CommandFailed(format!(
                        "volume '{}' entered error state after create",
                        slot
                    )));
                }
            }
        }
        Err(RdsError::Timeout(format!(
            "volume '{}' did not become ready",
            slot
        )))
    }

    async fn fetch_volume(&self, slot: &str) -> Result<RdsVolume> {
        let output = self
            .run(&format!("/disk print detail where slot={}", slot))
            .await?;
        let records = parse::parse_records(&output);
        match records.first() {
            Some(record) => Self::volume_from_record(record),
            None => Err(RdsError::VolumeNotFound(slot.to_string())),
        }
    }
}

#[async_trait]
impl VolumeBackend for RdsClient {
    async fn create_volume(
        &self,
        slot: &str,
        volume_path: &str,
        size_bytes: u64,
        nvme_port: u16,
        nqn: &str,
    ) -> Result<RdsVolume> {
        let file_path = self.validate_volume_args(slot, volume_path, nvme_port, nqn)?;

        let cmd = format!(
            "/disk add type=file file-path={} file-size={} slot={} nvme-tcp-export=yes nvme-tcp-server-port={} nvme-tcp-server-nqn={}",
            file_path,
            parse::format_human_size(size_bytes),
            slot,
            nvme_port,
            nqn
        );
        self.run(&cmd).await?;

        // The entry appears immediately but formats in the background; the
        // volume is usable only once the device reports ready.
        let volume = self.wait_until_ready(slot).await?;
        info!(slot = %slot, size_bytes = size_bytes, "RDS volume created");
        Ok(volume)
    }

    async fn get_volume(&self, slot: &str) -> Result<RdsVolume> {
        validate_slot(slot)?;
        self.fetch_volume(slot).await
    }

    async fn delete_volume(&self, slot: &str, volume_path: &str) -> Result<()> {
        validate_slot(slot)?;
        self.paths.validate(volume_path)?;
        let file_path = Self::backing_file_path(volume_path, slot);

        Self::absorb_missing(self.run(&format!("/disk remove [find slot={}]", slot)).await)?;

        // Backing file removal is best-effort; the orphan reconciler picks
        // up leftovers.
        let file_cmd = format!(
            "/file remove [find name=\"{}\"]",
            Self::file_name_for(&file_path)
        );
        if let Err(e) = Self::absorb_missing(self.run(&file_cmd).await) {
            warn!(slot = %slot, error = %e, "Failed to remove backing file; leaving for reconciler");
        }

        info!(slot = %slot, "RDS volume deleted");
        Ok(())
    }

    async fn resize_volume(&self, slot: &str, new_size_bytes: u64) -> Result<u64> {
        validate_slot(slot)?;
        let current = self.fetch_volume(slot).await?;

        if new_size_bytes < current.size_bytes {
            return Err(RdsError::InvalidArgument(format!(
                "shrink from {} to {} bytes is not supported",
                current.size_bytes, new_size_bytes
            )));
        }
        if new_size_bytes == current.size_bytes {
            return Ok(current.size_bytes);
        }

        let cmd = format!(
            "/disk set [find slot={}] file-size={}",
            slot,
            parse::format_human_size(new_size_bytes)
        );
        self.run(&cmd).await?;

        let resized = self.fetch_volume(slot).await?;
        if resized.size_bytes != new_size_bytes {
            return Err(RdsError::CommandFailed(format!(
                "volume '{}' reports {} bytes after resize to {}",
                slot, resized.size_bytes, new_size_bytes
            )));
        }
        info!(slot = %slot, size_bytes = new_size_bytes, "RDS volume resized");
        Ok(resized.size_bytes)
    }

    async fn list_volumes(&self, slot_prefix: &str) -> Result<Vec<RdsVolume>> {
        let output = self.run("/disk print detail").await?;
        let mut volumes = Vec::new();
        for record in parse::parse_records(&output) {
            if !record.get("slot").is_some_and(|s| s.starts_with(slot_prefix)) {
                continue;
            }
            volumes.push(Self::volume_from_record(&record)?);
        }
        Ok(volumes)
    }

    async fn create_snapshot(
        &self,
        snap_slot: &str,
        source_slot: &str,
        volume_path: &str,
    ) -> Result<RdsSnapshot> {
        validate_snapshot_slot(snap_slot)?;
        validate_slot(source_slot)?;
        self.paths.validate(volume_path)?;
        let file_path = Self::backing_file_path(volume_path, snap_slot);
        self.paths.validate(&file_path)?;

        // Snapshots copy the source file and are never NVMe-exported; the
        // entry inherits its size from the source.
        let cmd = format!(
            "/disk add type=file copy-from=[find slot={}] file-path={} slot={}",
            source_slot, file_path, snap_slot
        );
        self.run(&cmd).await?;

        let mut snapshot = Self::snapshot_from_volume(self.fetch_volume(snap_slot).await?);
        snapshot.source_slot = Some(source_slot.to_string());
        info!(snapshot = %snap_slot, source = %source_slot, "RDS snapshot created");
        Ok(snapshot)
    }

    async fn get_snapshot(&self, snap_slot: &str) -> Result<RdsSnapshot> {
        validate_snapshot_slot(snap_slot)?;
        let output = self
            .run(&format!("/disk print detail where slot={}", snap_slot))
            .await?;
        let records = parse::parse_records(&output);
        match records.first() {
            Some(record) => Ok(Self::snapshot_from_volume(Self::volume_from_record(record)?)),
            None => Err(RdsError::SnapshotNotFound(snap_slot.to_string())),
        }
    }

    async fn delete_snapshot(&self, snap_slot: &str, volume_path: &str) -> Result<()> {
        validate_snapshot_slot(snap_slot)?;
        self.paths.validate(volume_path)?;
        let file_path = Self::backing_file_path(volume_path, snap_slot);

        Self::absorb_missing(self.run(&format!("/disk remove [find slot={}]", snap_slot)).await)?;

        let file_cmd = format!(
            "/file remove [find name=\"{}\"]",
            Self::file_name_for(&file_path)
        );
        if let Err(e) = Self::absorb_missing(self.run(&file_cmd).await) {
            warn!(snapshot = %snap_slot, error = %e, "Failed to remove snapshot backing file");
        }

        info!(snapshot = %snap_slot, "RDS snapshot deleted");
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<RdsSnapshot>> {
        let volumes = self.list_volumes(SNAPSHOT_PREFIX).await?;
        Ok(volumes.into_iter().map(Self::snapshot_from_volume).collect())
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
        validate_snapshot_slot(snap_slot)?;
        let file_path = self.validate_volume_args(slot, volume_path, nvme_port, nqn)?;

        // Restore-into-larger is allowed; the explicit file-size grows the
        // copy to the requested capacity.
        let cmd = format!(
            "/disk add type=file copy-from=[find slot={}] file-path={} file-size={} slot={} nvme-tcp-export=yes nvme-tcp-server-port={} nvme-tcp-server-nqn={}",
            snap_slot,
            file_path,
            parse::format_human_size(size_bytes),
            slot,
            nvme_port,
            nqn
        );
        self.run(&cmd).await?;

        let volume = self.wait_until_ready(slot).await?;
        info!(slot = %slot, snapshot = %snap_slot, "RDS volume restored from snapshot");
        Ok(volume)
    }

    async fn get_capacity(&self, volume_path: &str) -> Result<CapacityInfo> {
        self.paths.validate(volume_path)?;
        let mount_point = mount_point_of(volume_path);
        let output = self
            .run(&format!("/disk print detail where mount-point={}", mount_point))
            .await?;

        let records = parse::parse_records(&output);
        let record = records.first().ok_or_else(|| {
            RdsError::Parse(format!("no disk with mount-point '{}'", mount_point))
        })?;

        let total = record
            .get("size")
            .map(|v| parse::parse_size(v))
            .transpose()?
            .ok_or_else(|| RdsError::Parse("capacity reply missing size".to_string()))?;
        let free = record
            .get("free")
            .map(|v| parse::parse_size(v))
            .transpose()?
            .ok_or_else(|| RdsError::Parse("capacity reply missing free".to_string()))?;

        Ok(CapacityInfo {
            total_bytes: total,
            free_bytes: free,
            observed_at: SystemTime::now(),
        })
    }

    async fn list_files(&self, volume_path: &str) -> Result<Vec<RdsFile>> {
        self.paths.validate(volume_path)?;
        let base = Self::file_name_for(volume_path);
        let output = self.run("/file print detail").await?;

        let mut files = Vec::new();
        for record in parse::parse_records(&output) {
            let Some(name) = record.get("name") else { continue };
            if !name.starts_with(base) || name == base {
                continue;
            }
            let size_bytes = record
                .get("size")
                .map(|v| parse::parse_size(v))
                .transpose()?
                .unwrap_or(0);
            let creation_time = record
                .get("creation-time")
                .and_then(|v| parse::parse_creation_time(v));
            files.push(RdsFile {
                name: name.clone(),
                size_bytes,
                creation_time,
            });
        }
        Ok(files)
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        // File names come back from RDS listings; re-validate as a rooted
        // path before echoing into a command.
        let absolute = format!("/{}", name.trim_start_matches('/'));
        self.paths.validate(&absolute)?;
        Self::absorb_missing(
            self.run(&format!("/file remove [find name=\"{}\"]", Self::file_name_for(&absolute)))
                .await,
        )
    }

    async fn disk_traffic(&self, slot: &str) -> Result<DiskTraffic> {
        validate_slot(slot)?;
        let output = self
            .run(&format!("/disk monitor-traffic {} once", slot))
            .await?;

        let mut traffic = DiskTraffic::default();
        for line in output.lines() {
            let Some((key, value)) = line.split_once(':') else { continue };
            match key.trim() {
                "read-rate" => traffic.read_bytes_per_sec = parse::parse_rate_to_bytes_per_sec(value.trim())?,
                "write-rate" => traffic.write_bytes_per_sec = parse::parse_rate_to_bytes_per_sec(value.trim())?,
                _ => {}
            }
        }
        Ok(traffic)
    }
}

/// The filesystem a base path lives on is identified by its first segment
/// (`/storage-pool/metal-csi` sits on the `storage-pool` disk).
fn mount_point_of(volume_path: &str) -> String {
    Path::new(volume_path)
        .components()
        .find_map(|c| match c {
            std::path::Component::Normal(seg) => Some(format!("/{}", seg.to_string_lossy())),
            _ => None,
        })
        .unwrap_or_else(|| "/".to_string())
}
