//! Orchestrator state access.
//!
//! VolumeAttachment objects are the authoritative record of which volume the
//! orchestrator wants on which node; PV listings drive orphan detection.
//! Both are read-only from the driver's side, behind a trait so the
//! attachment manager and reconciler can be tested against fakes.

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::ListParams;
use kube::{Api, Client};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    #[error("malformed cluster object: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// One attachment the orchestrator has recorded for this driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAttachment {
    pub slot: String,
    pub node: String,
}

#[async_trait]
pub trait ClusterState: Send + Sync {
    /// All VolumeAttachment records belonging to this driver, resolved to
    /// (slot, node) pairs.
    async fn list_attachments(&self) -> Result<Vec<ClusterAttachment>>;

    /// Volume handles of PersistentVolumes provisioned by this driver.
    async fn list_volume_handles(&self) -> Result<HashSet<String>>;
}

/// Production implementation over the Kubernetes API.
pub struct KubeClusterState {
    client: Client,
    driver_name: String,
}

impl KubeClusterState {
    pub fn new(client: Client, driver_name: String) -> Self {
        Self {
            client,
            driver_name,
        }
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn list_attachments(&self) -> Result<Vec<ClusterAttachment>> {
        let attachments: Api<VolumeAttachment> = Api::all(self.client.clone());
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());

        let mut resolved = Vec::new();
        for va in attachments.list(&ListParams::default()).await? {
            if va.spec.attacher != self.driver_name {
                continue;
            }
            let Some(pv_name) = va.spec.source.persistent_volume_name.clone() else {
                // Inline volumes are not supported by this driver.
                continue;
            };

            // The VolumeAttachment names the PV; the PV carries the CSI
            // volume handle (our slot). PV annotations are deliberately
            // ignored here: only the VolumeAttachment/PV spec chain is
            // authoritative.
            let pv = match volumes.get(&pv_name).await {
                Ok(pv) => pv,
                Err(kube::Error::Api(e)) if e.code == 404 => {
                    debug!(pv = %pv_name, "VolumeAttachment references missing PV; skipping");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let Some(csi) = pv.spec.as_ref().and_then(|spec| spec.csi.as_ref()) else {
                continue;
            };
            if csi.driver != self.driver_name {
                continue;
            }

            resolved.push(ClusterAttachment {
                slot: csi.volume_handle.clone(),
                node: va.spec.node_name.clone(),
            });
        }

        Ok(resolved)
    }

    async fn list_volume_handles(&self) -> Result<HashSet<String>> {
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());
        let mut handles = HashSet::new();
        for pv in volumes.list(&ListParams::default()).await? {
            if let Some(csi) = pv.spec.as_ref().and_then(|spec| spec.csi.as_ref())
                && csi.driver == self.driver_name
            {
                handles.insert(csi.volume_handle.clone());
            }
        }
        Ok(handles)
    }
}
