//! Typed views of RDS disk and file state.

use std::time::SystemTime;

/// Status reported by RDS for a file-backed disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeStatus {
    Ready,
    Formatting,
    Error,
    Unknown,
}

impl VolumeStatus {
    pub fn parse(s: &str) -> Self {
        match s {
            "ready" => VolumeStatus::Ready,
            "formatting" => VolumeStatus::Formatting,
            "error" => VolumeStatus::Error,
            _ => VolumeStatus::Unknown,
        }
    }
}

impl std::fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VolumeStatus::Ready => "ready",
            VolumeStatus::Formatting => "formatting",
            VolumeStatus::Error => "error",
            VolumeStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A file-backed disk entry on RDS.
#[derive(Debug, Clone)]
pub struct RdsVolume {
    /// Stable volume identifier (`pvc-<uuid>` or `snap-<uuid>-at-<ts>`).
    pub slot: String,
    /// Backing file path on the RDS filesystem.
    pub file_path: String,
    /// Provisioned size in bytes.
    pub size_bytes: u64,
    /// Whether the disk is exported over NVMe/TCP.
    pub nvme_export: bool,
    /// NVMe/TCP server port (0 when not exported).
    pub nvme_port: u16,
    /// NVMe qualified name (empty when not exported).
    pub nqn: String,
    pub status: VolumeStatus,
}

impl RdsVolume {
    pub fn is_snapshot(&self) -> bool {
        self.slot.starts_with("snap-")
    }
}

/// A snapshot entry: a non-exported disk whose slot carries the snap prefix.
#[derive(Debug, Clone)]
pub struct RdsSnapshot {
    pub slot: String,
    pub file_path: String,
    pub size_bytes: u64,
    /// Source volume slot, when known. RDS does not persist this; the
    /// controller keeps a secondary index and fills it in where it can.
    pub source_slot: Option<String>,
    /// Creation time recovered from the slot's `-at-<ts>` suffix.
    pub created_at: Option<SystemTime>,
}

/// A file entry from `/file print detail`.
#[derive(Debug, Clone)]
pub struct RdsFile {
    /// Path as RDS reports it (no leading slash).
    pub name: String,
    pub size_bytes: u64,
    pub creation_time: Option<SystemTime>,
}

/// Point-in-time capacity of the volume base path's disk.
#[derive(Debug, Clone, Copy)]
pub struct CapacityInfo {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub observed_at: SystemTime,
}

impl CapacityInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.free_bytes)
    }
}

/// One-shot traffic reading from `/disk monitor-traffic <slot> once`,
/// converted to bytes per second.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskTraffic {
    pub read_bytes_per_sec: u64,
    pub write_bytes_per_sec: u64,
}
