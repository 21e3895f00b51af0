//! RDS client library for the RDS CSI driver.
//!
//! Speaks the MikroTik ROSE Data Server management CLI over SSH and presents
//! a typed volume/snapshot/file/capacity API to the CSI controller.
//!
//! The library is split into several modules:
//! - `transport`: SSH session handling with host-key verification and retry
//! - `client`: typed command layer over the RDS CLI grammar
//! - `parse`: normalization and field extraction for `print detail` output
//! - `ident`: identifier derivation and validation
//! - `conn`: connection health monitoring and reconnection

pub mod client;
pub mod conn;
pub mod error;
pub mod ident;
pub mod parse;
pub mod transport;
pub mod types;

pub use client::{RdsClient, VolumeBackend};
pub use conn::{ConnectionManager, ConnectionManagerConfig, OnReconnect};
pub use error::{RdsError, Result};
pub use transport::{SshTransport, TransportConfig};
pub use types::{CapacityInfo, DiskTraffic, RdsFile, RdsSnapshot, RdsVolume, VolumeStatus};
