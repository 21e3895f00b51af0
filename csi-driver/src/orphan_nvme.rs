//! Stale NVMe session cleanup at node startup.
//!
//! A node crash can leave NVMe/TCP sessions behind with no mount using
//! them. They hold the target open on the RDS side and block clean
//! re-attachment, so before the node service starts serving we disconnect
//! every driver-owned session that nothing references.

use std::time::Duration;

use tracing::{info, warn};

use crate::metrics;
use crate::mount::Mounter;
use crate::nvme::NvmeConnector;

/// Bound on the whole sweep so a large orphan backlog cannot stall node
/// startup indefinitely.
const STARTUP_BUDGET: Duration = Duration::from_secs(120);

pub struct OrphanNvmeCleaner {
    nvme: NvmeConnector,
    mounter: Mounter,
    /// NQNs under this prefix belong to the driver and are fair game.
    nqn_prefix: String,
}

impl OrphanNvmeCleaner {
    pub fn new(nvme: NvmeConnector, mounter: Mounter, nqn_prefix: String) -> Self {
        Self {
            nvme,
            mounter,
            nqn_prefix,
        }
    }

    /// Run the sweep once, best-effort. Individual failures are logged and
    /// skipped; the count of cleaned sessions is returned.
    pub async fn run(&self) -> usize {
        match tokio::time::timeout(STARTUP_BUDGET, self.sweep()).await {
            Ok(cleaned) => cleaned,
            Err(_) => {
                warn!("Orphan NVMe cleanup exceeded startup budget; continuing with node startup");
                0
            }
        }
    }

    async fn sweep(&self) -> usize {
        let prefix = format!("{}:", self.nqn_prefix.trim_end_matches(':'));
        let sessions = match self.nvme.list_connections_by_prefix(&prefix) {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "Failed to enumerate NVMe sessions; skipping orphan cleanup");
                return 0;
            }
        };

        info!(
            sessions = sessions.len(),
            prefix = %prefix,
            "Checking NVMe sessions for orphans"
        );

        let mut cleaned = 0;
        for nqn in sessions {
            match self.is_referenced(&nqn) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(nqn = %nqn, error = %e, "Could not determine session usage; leaving connected");
                    continue;
                }
            }

            info!(nqn = %nqn, "Disconnecting orphaned NVMe session");
            match self.nvme.disconnect(&nqn).await {
                Ok(()) => {
                    metrics::record_orphan_nvme_cleaned();
                    cleaned += 1;
                }
                Err(e) => {
                    warn!(nqn = %nqn, error = %e, "Failed to disconnect orphaned session");
                }
            }
        }

        info!(cleaned = cleaned, "Orphan NVMe cleanup finished");
        cleaned
    }

    /// A session is referenced when its namespace device backs any mount.
    fn is_referenced(&self, nqn: &str) -> std::io::Result<bool> {
        let device = self
            .nvme
            .find_device(nqn)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        match device {
            Some(device) => self
                .mounter
                .is_device_mounted(&device)
                .map_err(|e| std::io::Error::other(e.to_string())),
            // No block device at all: nothing can be using it.
            None => Ok(false),
        }
    }
}
