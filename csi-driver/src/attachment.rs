//! Cluster-wide attachment tracking.
//!
//! The in-memory map answers fencing decisions; the orchestrator's
//! VolumeAttachment objects are the durable record it is rebuilt from on
//! controller restart. Lock ordering is strict: the map's RwLock is never
//! held while acquiring a per-slot mutex, and per-slot mutexes are never
//! held across RDS calls made from inside this module (it makes none).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cluster::ClusterState;
use crate::metrics;

#[derive(Error, Debug)]
pub enum AttachmentError {
    #[error("volume '{slot}' is attached to node '{holder}'")]
    Fencing { slot: String, holder: String },

    #[error("volume '{slot}' already has a handoff in progress")]
    HandoffInProgress { slot: String },

    #[error("failed to rebuild attachments from cluster: {0}")]
    Rebuild(#[from] crate::cluster::ClusterError),
}

pub type Result<T> = std::result::Result<T, AttachmentError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffState {
    None,
    Draining,
}

#[derive(Debug, Clone)]
struct Attachment {
    node: String,
    attached_at: SystemTime,
}

/// Per-slot record: the owning attachment plus, during a live-migration
/// handoff, the node being drained away from.
#[derive(Debug, Clone)]
struct Entry {
    /// Index 0 is the attachment being drained (the older node) while a
    /// handoff is active; otherwise the sole owner.
    attachments: Vec<Attachment>,
    handoff_started: Option<SystemTime>,
}

impl Entry {
    fn holds(&self, node: &str) -> bool {
        self.attachments.iter().any(|a| a.node == node)
    }
}

/// Observable view of one tracked attachment, for reporting and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedAttachment {
    pub slot: String,
    pub node: String,
    pub attached_at: SystemTime,
    pub handoff: HandoffState,
}

pub struct AttachmentManager {
    records: RwLock<HashMap<String, Entry>>,
    slot_locks: std::sync::Mutex<HashMap<String, (Arc<Mutex<()>>, usize)>>,
    handoff_grace: Duration,
    clock: Arc<dyn Clock>,
    reconcile_notify: Arc<Notify>,
}

impl AttachmentManager {
    pub fn new(handoff_grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            slot_locks: std::sync::Mutex::new(HashMap::new()),
            handoff_grace,
            clock,
            reconcile_notify: Arc::new(Notify::new()),
        }
    }

    /// Serialize all operations touching one slot. The registry entry is
    /// refcounted so slots that are done with are freed rather than
    /// accumulating for the life of the process.
    pub async fn lock_slot(self: &Arc<Self>, slot: &str) -> SlotGuard {
        let lock = {
            let mut registry = self.slot_locks.lock().unwrap();
            let (lock, refs) = registry
                .entry(slot.to_string())
                .or_insert_with(|| (Arc::new(Mutex::new(())), 0));
            *refs += 1;
            lock.clone()
        };

        let guard = lock.lock_owned().await;
        SlotGuard {
            manager: self.clone(),
            slot: slot.to_string(),
            _guard: guard,
        }
    }

    fn release_slot_lock(&self, slot: &str) {
        let mut registry = self.slot_locks.lock().unwrap();
        if let Some((_, refs)) = registry.get_mut(slot) {
            *refs -= 1;
            if *refs == 0 {
                registry.remove(slot);
            }
        }
    }

    /// Record an attachment of `slot` to `node`.
    ///
    /// Filesystem / single-node semantics fence a second node outright.
    /// Multi-node block volumes may hold two nodes during a handoff; a
    /// third node is always rejected.
    pub async fn track(&self, slot: &str, node: &str, multi_node_block: bool) -> Result<()> {
        let now = self.clock.now();
        let mut records = self.records.write().await;

        let entry = match records.get_mut(slot) {
            None => {
                records.insert(
                    slot.to_string(),
                    Entry {
                        attachments: vec![Attachment {
                            node: node.to_string(),
                            attached_at: now,
                        }],
                        handoff_started: None,
                    },
                );
                info!(slot = %slot, node = %node, "Attachment tracked");
                metrics::set_attachments_tracked(records.len());
                return Ok(());
            }
            Some(entry) => entry,
        };

        if entry.holds(node) {
            debug!(slot = %slot, node = %node, "Attachment already tracked; idempotent");
            return Ok(());
        }

        if !multi_node_block {
            let holder = entry.attachments[0].node.clone();
            warn!(slot = %slot, node = %node, holder = %holder, "Fencing second attachment");
            return Err(AttachmentError::Fencing {
                slot: slot.to_string(),
                holder,
            });
        }

        // A drained node that overstayed the grace period forfeits its
        // attachment; the migration it was part of is long over.
        if let Some(started) = entry.handoff_started
            && now.duration_since(started).unwrap_or(Duration::ZERO) > self.handoff_grace
        {
            let expired = entry.attachments.remove(0);
            entry.handoff_started = None;
            warn!(
                slot = %slot,
                node = %expired.node,
                "Releasing drained attachment past grace period"
            );
        }

        if entry.attachments.len() >= 2 {
            return Err(AttachmentError::HandoffInProgress {
                slot: slot.to_string(),
            });
        }

        if entry.handoff_started.is_some() {
            return Err(AttachmentError::HandoffInProgress {
                slot: slot.to_string(),
            });
        }

        // Second node on a multi-node block volume: live migration begins;
        // the existing attachment starts draining.
        entry.attachments.push(Attachment {
            node: node.to_string(),
            attached_at: now,
        });
        entry.handoff_started = Some(now);
        info!(slot = %slot, node = %node, "Handoff started; prior node draining");
        Ok(())
    }

    /// Remove an attachment. Idempotent; unknown (slot, node) pairs are
    /// success. Removing the draining side promotes the survivor.
    pub async fn untrack(&self, slot: &str, node: &str) {
        let mut records = self.records.write().await;
        let Some(entry) = records.get_mut(slot) else {
            debug!(slot = %slot, node = %node, "Untrack of unknown slot; idempotent");
            return;
        };

        let before = entry.attachments.len();
        entry.attachments.retain(|a| a.node != node);
        if entry.attachments.len() == before {
            debug!(slot = %slot, node = %node, "Untrack of unattached node; idempotent");
            return;
        }

        if entry.attachments.is_empty() {
            records.remove(slot);
        } else {
            // Handoff complete: the remaining node owns the volume alone.
            entry.handoff_started = None;
        }
        info!(slot = %slot, node = %node, "Attachment untracked");
        metrics::set_attachments_tracked(records.len());
    }

    /// Node currently holding a slot, if any (the surviving owner during a
    /// handoff).
    pub async fn node_for(&self, slot: &str) -> Option<String> {
        let records = self.records.read().await;
        records
            .get(slot)
            .and_then(|entry| entry.attachments.last())
            .map(|a| a.node.clone())
    }

    pub async fn list(&self) -> Vec<TrackedAttachment> {
        let records = self.records.read().await;
        let mut out = Vec::new();
        for (slot, entry) in records.iter() {
            let draining = entry.handoff_started.is_some();
            for (index, attachment) in entry.attachments.iter().enumerate() {
                out.push(TrackedAttachment {
                    slot: slot.clone(),
                    node: attachment.node.clone(),
                    attached_at: attachment.attached_at,
                    handoff: if draining && index == 0 {
                        HandoffState::Draining
                    } else {
                        HandoffState::None
                    },
                });
            }
        }
        out.sort_by(|a, b| (a.slot.clone(), a.node.clone()).cmp(&(b.slot.clone(), b.node.clone())));
        out
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }

    /// Rebuild the map from the orchestrator's VolumeAttachment objects.
    /// Called once at controller start, before the gRPC server accepts
    /// traffic; a failure here fails startup.
    pub async fn initialize(&self, cluster: &dyn ClusterState) -> Result<()> {
        let attachments = cluster.list_attachments().await?;
        let now = self.clock.now();

        let mut rebuilt: HashMap<String, Entry> = HashMap::new();
        for attachment in attachments {
            let entry = rebuilt.entry(attachment.slot.clone()).or_insert_with(|| Entry {
                attachments: Vec::new(),
                handoff_started: None,
            });
            if entry.holds(&attachment.node) {
                continue;
            }
            entry.attachments.push(Attachment {
                node: attachment.node.clone(),
                attached_at: now,
            });
            // Two nodes in the durable record means the controller died
            // mid-migration; resume the handoff clock from now.
            if entry.attachments.len() == 2 {
                entry.handoff_started = Some(now);
            }
        }

        let count = rebuilt.len();
        let mut records = self.records.write().await;
        *records = rebuilt;
        metrics::set_attachments_tracked(count);
        info!(attachments = count, "Attachment map rebuilt from VolumeAttachments");
        Ok(())
    }

    /// Drop in-memory entries the orchestrator no longer has a
    /// VolumeAttachment for. Transient cluster errors leave the map alone.
    pub async fn reconcile(&self, cluster: &dyn ClusterState) -> Result<()> {
        let cluster_view = cluster.list_attachments().await?;
        let live: std::collections::HashSet<(String, String)> = cluster_view
            .into_iter()
            .map(|a| (a.slot, a.node))
            .collect();

        let mut records = self.records.write().await;
        let mut removed = 0usize;
        records.retain(|slot, entry| {
            let before = entry.attachments.len();
            entry
                .attachments
                .retain(|a| live.contains(&(slot.clone(), a.node.clone())));
            removed += before - entry.attachments.len();
            if entry.attachments.len() < 2 {
                entry.handoff_started = None;
            }
            !entry.attachments.is_empty()
        });

        if removed > 0 {
            info!(removed = removed, "Dropped attachments canceled by the orchestrator");
            metrics::set_attachments_tracked(records.len());
        }
        Ok(())
    }

    /// Handle used by the connection manager to request an immediate
    /// reconcile pass after an RDS reconnect.
    pub fn reconcile_trigger(&self) -> Arc<Notify> {
        self.reconcile_notify.clone()
    }

    /// Periodic reconciliation; also woken by [`reconcile_trigger`].
    pub async fn reconcile_loop(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterState>,
        interval: Duration,
    ) {
        let notify = self.reconcile_notify.clone();
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, initialize() just ran.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = notify.notified() => {}
            }
            if let Err(e) = self.reconcile(cluster.as_ref()).await {
                // Do not evict on transient orchestrator errors; retry at
                // the next tick.
                warn!(error = %e, "Attachment reconciliation failed");
            }
        }
    }
}

/// Holds one slot's mutex; dropping releases it and trims the registry.
pub struct SlotGuard {
    manager: Arc<AttachmentManager>,
    slot: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.manager.release_slot_lock(&self.slot);
    }
}
