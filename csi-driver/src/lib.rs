//! RDS CSI Driver Library
//!
//! Kubernetes CSI driver that provisions file-backed NVMe/TCP volumes on a
//! MikroTik ROSE Data Server (RDS) and attaches them to workloads.
//!
//! This library provides:
//! - CSI Identity, Controller, and Node service implementations
//! - Cluster-wide attachment tracking rebuilt from VolumeAttachment objects
//! - Node-side NVMe/TCP and filesystem plumbing
//! - Background reconciliation of RDS state against the orchestrator

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod attachment;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod identity;
pub mod metrics;
pub mod mount;
pub mod node;
pub mod nvme;
pub mod orphan_nvme;
pub mod reconciler;

#[cfg(test)]
pub mod test_support;

pub use attachment::AttachmentManager;
pub use config::DriverConfig;
pub use controller::ControllerService;
pub use identity::{IdentityService, ReadinessState};
pub use node::NodeService;
