//! Controller-side orphan reconciliation.
//!
//! The RDS keeps volumes alive as long as their disk entries exist; if the
//! orchestrator loses track of one (PV force-deleted, CreateVolume reply
//! lost), the backing file leaks. The reconciler periodically
//! cross-references RDS state against cluster PVs and removes what nothing
//! references, after a grace period, through the same per-slot-locked
//! delete path the controller uses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex;
use tracing::{info, warn};

use rds_client::VolumeBackend;
use rds_client::ident::{SNAPSHOT_PREFIX, VOLUME_PREFIX};
use rds_client::types::{RdsFile, RdsVolume};

use crate::attachment::AttachmentManager;
use crate::clock::Clock;
use crate::cluster::ClusterState;
use crate::config::{DriverConfig, OrphanConfig};
use crate::metrics;

/// What one sweep decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrphanAction {
    DeleteVolume(String),
    DeleteFile(String),
}

pub struct OrphanReconciler {
    backend: Arc<dyn VolumeBackend>,
    cluster: Arc<dyn ClusterState>,
    attachments: Arc<AttachmentManager>,
    driver: DriverConfig,
    config: OrphanConfig,
    clock: Arc<dyn Clock>,
    /// Ages for objects whose RDS creation time could not be parsed: an
    /// object is deleted only after being continuously orphaned for the
    /// grace period from when this reconciler first saw it.
    first_seen: Mutex<HashMap<String, SystemTime>>,
}

impl OrphanReconciler {
    pub fn new(
        backend: Arc<dyn VolumeBackend>,
        cluster: Arc<dyn ClusterState>,
        attachments: Arc<AttachmentManager>,
        driver: DriverConfig,
        config: OrphanConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            cluster,
            attachments,
            driver,
            config,
            clock,
            first_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Periodic sweep task. Failures are logged and counted; nothing here
    /// ever fails a user-visible operation.
    pub async fn run(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.config.check_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tick.tick().await;
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "Orphan sweep failed");
                metrics::record_orphan_rds("sweep", "failed");
            }
        }
    }

    /// One full sweep: gather, plan, execute.
    pub async fn sweep(&self) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let base_path = self.driver.volume_base_path_str();
        let volumes = self.backend.list_volumes(VOLUME_PREFIX).await?;
        let snapshots = self.backend.list_snapshots().await?;
        let files = self.backend.list_files(&base_path).await?;
        let pv_handles = self.cluster.list_volume_handles().await?;

        let snapshot_files: HashSet<String> = snapshots
            .iter()
            .map(|s| s.file_path.trim_start_matches('/').to_string())
            .collect();

        let now = self.clock.now();
        let actions = {
            let mut first_seen = self.first_seen.lock().await;
            plan_sweep(
                &volumes,
                &files,
                &pv_handles,
                &snapshot_files,
                &mut first_seen,
                now,
                self.config.grace_period,
            )
        };

        info!(
            volumes = volumes.len(),
            files = files.len(),
            pvs = pv_handles.len(),
            orphans = actions.len(),
            dry_run = self.config.dry_run,
            "Orphan sweep"
        );

        let mut handled = 0usize;
        for action in actions {
            match action {
                OrphanAction::DeleteVolume(slot) => {
                    if self.config.dry_run {
                        info!(slot = %slot, "Orphaned RDS volume (dry-run; not deleting)");
                        metrics::record_orphan_rds("volume", "reported");
                        continue;
                    }
                    // Same serialization as a controller DeleteVolume: no
                    // sweep may race an in-flight operation on the slot.
                    let guard = self.attachments.lock_slot(&slot).await;
                    let result = self.backend.delete_volume(&slot, &base_path).await;
                    drop(guard);
                    match result {
                        Ok(()) => {
                            info!(slot = %slot, "Deleted orphaned RDS volume");
                            metrics::record_orphan_rds("volume", "deleted");
                            handled += 1;
                        }
                        Err(e) => {
                            warn!(slot = %slot, error = %e, "Failed to delete orphaned volume");
                            metrics::record_orphan_rds("volume", "failed");
                        }
                    }
                }
                OrphanAction::DeleteFile(name) => {
                    if self.config.dry_run {
                        info!(file = %name, "Orphaned RDS file (dry-run; not deleting)");
                        metrics::record_orphan_rds("file", "reported");
                        continue;
                    }
                    match self.backend.delete_file(&name).await {
                        Ok(()) => {
                            info!(file = %name, "Deleted orphaned RDS file");
                            metrics::record_orphan_rds("file", "deleted");
                            handled += 1;
                        }
                        Err(e) => {
                            warn!(file = %name, error = %e, "Failed to delete orphaned file");
                            metrics::record_orphan_rds("file", "failed");
                        }
                    }
                }
            }
        }

        Ok(handled)
    }
}

/// Decide which RDS objects are orphans. Pure so the policy is testable
/// without a device.
///
/// A volume is orphaned when no PV claims its slot; a file is orphaned when
/// no disk entry (volume or snapshot) references it. Either must also be
/// older than the grace period, taken from the RDS creation time when
/// parseable, else from the first sweep that saw it orphaned.
pub fn plan_sweep(
    volumes: &[RdsVolume],
    files: &[RdsFile],
    pv_handles: &HashSet<String>,
    snapshot_files: &HashSet<String>,
    first_seen: &mut HashMap<String, SystemTime>,
    now: SystemTime,
    grace: Duration,
) -> Vec<OrphanAction> {
    let mut actions = Vec::new();
    let mut still_orphaned: HashSet<String> = HashSet::new();

    let file_times: HashMap<&str, Option<SystemTime>> = files
        .iter()
        .map(|f| (f.name.as_str(), f.creation_time))
        .collect();

    for volume in volumes {
        if !volume.slot.starts_with(VOLUME_PREFIX) || pv_handles.contains(&volume.slot) {
            continue;
        }
        let created = file_times
            .get(volume.file_path.trim_start_matches('/'))
            .copied()
            .flatten();
        let key = format!("volume/{}", volume.slot);
        still_orphaned.insert(key.clone());
        if is_past_grace(created, &key, first_seen, now, grace) {
            actions.push(OrphanAction::DeleteVolume(volume.slot.clone()));
        }
    }

    // Files with no disk entry at all: left over from a partially failed
    // delete. Only touch names this driver would have generated.
    let referenced: HashSet<&str> = volumes
        .iter()
        .map(|v| v.file_path.trim_start_matches('/'))
        .chain(snapshot_files.iter().map(|s| s.as_str()))
        .collect();
    for file in files {
        if referenced.contains(file.name.as_str()) {
            continue;
        }
        let base = file
            .name
            .rsplit('/')
            .next()
            .unwrap_or(file.name.as_str());
        if !base.starts_with(VOLUME_PREFIX) && !base.starts_with(SNAPSHOT_PREFIX) {
            continue;
        }
        let key = format!("file/{}", file.name);
        still_orphaned.insert(key.clone());
        if is_past_grace(file.creation_time, &key, first_seen, now, grace) {
            actions.push(OrphanAction::DeleteFile(file.name.clone()));
        }
    }

    // Objects that regained a reference (or are gone) stop aging.
    first_seen.retain(|key, _| still_orphaned.contains(key));

    actions
}

fn is_past_grace(
    created: Option<SystemTime>,
    key: &str,
    first_seen: &mut HashMap<String, SystemTime>,
    now: SystemTime,
    grace: Duration,
) -> bool {
    let reference = match created {
        Some(t) => t,
        None => *first_seen.entry(key.to_string()).or_insert(now),
    };
    now.duration_since(reference).unwrap_or(Duration::ZERO) >= grace
}
