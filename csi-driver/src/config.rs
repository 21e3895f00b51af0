//! Driver configuration.
//!
//! Everything the components need is carried in explicit structs built once
//! in `main` from CLI flags; nothing reads process-global state.

use std::path::PathBuf;
use std::time::Duration;

/// Plugin name advertised to the orchestrator.
pub const DEFAULT_DRIVER_NAME: &str = "rds.csi.srvlab.io";

/// Smallest volume this driver provisions.
pub const MIN_VOLUME_SIZE: u64 = 1 << 30; // 1 GiB
/// Largest volume this driver provisions.
pub const MAX_VOLUME_SIZE: u64 = 16 << 40; // 16 TiB

/// StorageClass parameter defaults.
pub const DEFAULT_NVME_PORT: u16 = 4420;
pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_FS_TYPE: &str = "ext4";
pub const DEFAULT_VOLUME_PATH: &str = "/storage-pool/metal-csi";
pub const DEFAULT_NQN_PREFIX: &str = "nqn.2000-02.com.mikrotik";

/// Configuration shared by the controller and node services.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_name: String,
    pub node_id: String,
    /// RDS management address, also the default NVMe/TCP address handed to
    /// nodes unless the StorageClass overrides it.
    pub rds_address: String,
    pub volume_base_path: PathBuf,
    pub nqn_prefix: String,
    pub nvme_port: u16,
    pub fs_type: String,
    /// How long the older side of a live-migration handoff may linger.
    pub attachment_grace_period: Duration,
    pub attachment_reconcile_interval: Duration,
}

impl DriverConfig {
    pub fn volume_base_path_str(&self) -> String {
        self.volume_base_path.to_string_lossy().to_string()
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            driver_name: DEFAULT_DRIVER_NAME.to_string(),
            node_id: String::new(),
            rds_address: String::new(),
            volume_base_path: PathBuf::from(DEFAULT_VOLUME_PATH),
            nqn_prefix: DEFAULT_NQN_PREFIX.to_string(),
            nvme_port: DEFAULT_NVME_PORT,
            fs_type: DEFAULT_FS_TYPE.to_string(),
            attachment_grace_period: Duration::from_secs(30),
            attachment_reconcile_interval: Duration::from_secs(300),
        }
    }
}

/// Orphan reconciler tuning.
#[derive(Debug, Clone)]
pub struct OrphanConfig {
    pub enabled: bool,
    pub check_interval: Duration,
    /// Minimum age before an unreferenced volume is considered orphaned.
    pub grace_period: Duration,
    /// Report-only mode: log and count, never delete.
    pub dry_run: bool,
}

impl Default for OrphanConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval: Duration::from_secs(3600),
            grace_period: Duration::from_secs(300),
            dry_run: true,
        }
    }
}
