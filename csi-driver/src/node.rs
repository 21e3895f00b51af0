//! CSI Node Service Implementation
//!
//! Connects NVMe/TCP targets, stages filesystems, and publishes volumes
//! into pod target paths via bind mounts (or device nodes for block mode).

use std::collections::HashMap;
use std::path::Path;

use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use rds_client::ident::{validate_ipv4, validate_nqn, validate_port};

use crate::config::DriverConfig;
use crate::csi;
use crate::metrics::OperationTimer;
use crate::mount::{MountError, Mounter};
use crate::nvme::NvmeConnector;

/// Volume context keys set by the controller at CreateVolume time.
const CTX_NVME_ADDRESS: &str = "nvmeAddress";
const CTX_NVME_PORT: &str = "nvmePort";
const CTX_NQN: &str = "nqn";
const CTX_FS_TYPE: &str = "fsType";

/// Validated NVMe/TCP coordinates from the volume context.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StageContext {
    nvme_address: String,
    nvme_port: u16,
    nqn: String,
    fs_type: String,
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (NVMe/TCP connect, format, mount to staging path)
/// - Volume unstaging (unmount, NVMe disconnect)
/// - Volume publishing (bind mount from staging to pod target path)
/// - Volume unpublishing, expansion, and stats
pub struct NodeService {
    config: DriverConfig,
    mounter: Mounter,
    nvme: NvmeConnector,
}

impl NodeService {
    pub fn new(config: DriverConfig, mounter: Mounter, nvme: NvmeConnector) -> Self {
        Self {
            config,
            mounter,
            nvme,
        }
    }

    /// Validate that a kubelet-supplied path is safe to hand to mount
    /// tooling.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("path cannot be empty"));
        }
        if !path.starts_with('/') {
            return Err(Status::invalid_argument("path must be absolute"));
        }
        let dangerous = [';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r'];
        for c in dangerous {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "path contains dangerous character: '{}'",
                    c
                )));
            }
        }
        if path.contains("..") {
            return Err(Status::invalid_argument(
                "path cannot contain '..' (path traversal)",
            ));
        }
        Ok(())
    }

    /// Pull and validate the NVMe coordinates the controller put into the
    /// volume context.
    fn stage_context(volume_context: &HashMap<String, String>) -> Result<StageContext, Status> {
        let nvme_address = volume_context
            .get(CTX_NVME_ADDRESS)
            .ok_or_else(|| Status::invalid_argument("nvmeAddress is required in volume context"))?
            .clone();
        validate_ipv4(&nvme_address).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let nvme_port = volume_context
            .get(CTX_NVME_PORT)
            .ok_or_else(|| Status::invalid_argument("nvmePort is required in volume context"))?
            .parse::<u32>()
            .map_err(|_| Status::invalid_argument("malformed nvmePort in volume context"))?;
        let nvme_port =
            validate_port(nvme_port, false).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let nqn = volume_context
            .get(CTX_NQN)
            .ok_or_else(|| Status::invalid_argument("nqn is required in volume context"))?
            .clone();
        validate_nqn(&nqn).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let fs_type = volume_context
            .get(CTX_FS_TYPE)
            .cloned()
            .unwrap_or_else(|| "ext4".to_string());

        Ok(StageContext {
            nvme_address,
            nvme_port,
            nqn,
            fs_type,
        })
    }

    fn is_block_capability(capability: Option<&csi::VolumeCapability>) -> bool {
        matches!(
            capability.and_then(|c| c.access_type.as_ref()),
            Some(csi::volume_capability::AccessType::Block(_))
        )
    }

    fn mount_flags(capability: Option<&csi::VolumeCapability>) -> Vec<String> {
        match capability.and_then(|c| c.access_type.as_ref()) {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount.mount_flags.clone(),
            _ => Vec::new(),
        }
    }

    fn map_mount_error(e: MountError) -> Status {
        warn!(error = %e, "Mount operation failed");
        match e {
            MountError::FsMismatch { .. } => Status::already_exists(e.to_string()),
            MountError::ForbiddenOption(_) | MountError::UnsupportedFsType(_) => {
                Status::invalid_argument(e.to_string())
            }
            MountError::Timeout(..) => Status::deadline_exceeded(e.to_string()),
            _ => Status::internal("filesystem operation failed"),
        }
    }

    fn map_nvme_error(e: crate::nvme::NvmeError) -> Status {
        warn!(error = %e, "NVMe operation failed");
        match e {
            crate::nvme::NvmeError::Timeout(..) => Status::deadline_exceeded(e.to_string()),
            crate::nvme::NvmeError::DeviceNotFound(_) => {
                Status::internal("NVMe device did not appear")
            }
            _ => Status::internal("NVMe operation failed"),
        }
    }

    /// Size of a block device in bytes, from sysfs.
    fn device_size_bytes(device: &str) -> Result<i64, Status> {
        let name = device.trim_start_matches("/dev/");
        let sectors = std::fs::read_to_string(format!("/sys/class/block/{}/size", name))
            .map_err(|e| Status::internal(format!("failed to read device size: {}", e)))?;
        let sectors: i64 = sectors
            .trim()
            .parse()
            .map_err(|_| Status::internal("malformed device size"))?;
        Ok(sectors * 512)
    }

    /// An NVMe session belonging to a slot, regardless of which NQN prefix
    /// the StorageClass used.
    fn session_for_slot(&self, volume_id: &str) -> Option<String> {
        let suffix = format!(":{}", volume_id);
        self.nvme
            .list_connections_by_prefix("nqn.")
            .ok()?
            .into_iter()
            .find(|nqn| nqn.ends_with(&suffix))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume: connect the NVMe/TCP target, format if needed, and
    /// mount to the staging path (filesystem mode) or verify the device
    /// (block mode).
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("node_stage_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.staging_target_path.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        let context = Self::stage_context(&req.volume_context)?;
        let block_mode = Self::is_block_capability(req.volume_capability.as_ref());
        let mount_flags = Self::mount_flags(req.volume_capability.as_ref());

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            block = block_mode,
            "NodeStageVolume request"
        );

        // Idempotency: an existing staging mount for this volume means a
        // retry. Identical parameters succeed, a different filesystem is a
        // conflicting stage.
        if !block_mode
            && self
                .mounter
                .is_mounted(&req.staging_target_path)
                .map_err(Self::map_mount_error)?
        {
            let staged_device = self
                .mounter
                .device_for_mount(&req.staging_target_path)
                .map_err(Self::map_mount_error)?;
            if let Some(device) = staged_device {
                let found = self
                    .mounter
                    .detect_fs_type(&device)
                    .await
                    .map_err(Self::map_mount_error)?;
                if found.as_deref() != Some(context.fs_type.as_str()) {
                    timer.failure("already_exists");
                    return Err(Status::already_exists(format!(
                        "volume '{}' staged with different parameters",
                        req.volume_id
                    )));
                }
            }
            info!(staging_target_path = %req.staging_target_path, "Volume already staged");
            timer.success();
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        let device = self
            .nvme
            .connect(&context.nvme_address, context.nvme_port, &context.nqn)
            .await
            .map_err(Self::map_nvme_error)?;

        if block_mode {
            // Nothing to format or mount; publish binds the device node.
            debug!(volume_id = %req.volume_id, device = %device, "Block volume staged");
        } else {
            self.mounter
                .ensure_formatted(&device, &context.fs_type, &[])
                .await
                .map_err(Self::map_mount_error)?;
            self.mounter
                .mount(&device, &req.staging_target_path, &context.fs_type, &mount_flags)
                .await
                .map_err(Self::map_mount_error)?;
        }

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            device = %device,
            "Volume staged successfully"
        );
        timer.success();
        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage a volume: unmount the staging path and drop the NVMe
    /// session. Idempotent, and recovers from partial prior failures.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("node_unstage_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.staging_target_path.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("staging target path is required"));
        }
        Self::validate_path(&req.staging_target_path)?;

        info!(
            volume_id = %req.volume_id,
            staging_target_path = %req.staging_target_path,
            "NodeUnstageVolume request"
        );

        self.mounter
            .unmount(&req.staging_target_path)
            .await
            .map_err(Self::map_mount_error)?;

        // The unstage request carries no volume context, so the session is
        // found by its slot suffix among connected NQNs.
        if let Some(nqn) = self.session_for_slot(&req.volume_id) {
            self.nvme
                .disconnect(&nqn)
                .await
                .map_err(Self::map_nvme_error)?;
        } else {
            debug!(volume_id = %req.volume_id, "No NVMe session for volume; already disconnected");
        }

        info!(volume_id = %req.volume_id, "Volume unstaged successfully");
        timer.success();
        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish a volume into the pod's target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("node_publish_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.target_path.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        let block_mode = Self::is_block_capability(req.volume_capability.as_ref());
        let mut options = Self::mount_flags(req.volume_capability.as_ref());
        if req.readonly {
            options.push("ro".to_string());
        }

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            readonly = req.readonly,
            block = block_mode,
            "NodePublishVolume request"
        );

        if self
            .mounter
            .is_mounted(&req.target_path)
            .map_err(Self::map_mount_error)?
        {
            info!(target_path = %req.target_path, "Volume already published");
            timer.success();
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        let source = if block_mode {
            // Bind the namespace device node itself over the target file.
            let context = Self::stage_context(&req.volume_context)?;
            self.nvme
                .find_device(&context.nqn)
                .map_err(|e| Status::internal(format!("device lookup failed: {}", e)))?
                .ok_or_else(|| {
                    Status::failed_precondition(format!(
                        "volume '{}' is not staged (no NVMe device)",
                        req.volume_id
                    ))
                })?
        } else {
            if req.staging_target_path.is_empty() {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(
                    "staging target path is required (STAGE_UNSTAGE_VOLUME capability is enabled)",
                ));
            }
            Self::validate_path(&req.staging_target_path)?;
            if !self
                .mounter
                .is_mounted(&req.staging_target_path)
                .map_err(Self::map_mount_error)?
            {
                timer.failure("failed_precondition");
                return Err(Status::failed_precondition(format!(
                    "volume not staged at {}",
                    req.staging_target_path
                )));
            }
            req.staging_target_path.clone()
        };

        self.mounter
            .bind_mount(&source, &req.target_path, &options)
            .await
            .map_err(Self::map_mount_error)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "Volume published successfully"
        );
        timer.success();
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path. Idempotent.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("node_unpublish_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.target_path.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("target path is required"));
        }
        Self::validate_path(&req.target_path)?;

        info!(
            volume_id = %req.volume_id,
            target_path = %req.target_path,
            "NodeUnpublishVolume request"
        );

        self.mounter
            .unmount(&req.target_path)
            .await
            .map_err(Self::map_mount_error)?;

        // Clean the target (directory for filesystem mode, file for block
        // mode); leftovers only warn.
        let target = Path::new(&req.target_path);
        if target.exists() {
            let result = if target.is_dir() {
                std::fs::remove_dir(target)
            } else {
                std::fs::remove_file(target)
            };
            if let Err(e) = result {
                warn!(error = %e, target_path = %req.target_path, "Could not remove target path");
            }
        }

        info!(volume_id = %req.volume_id, "Volume unpublished successfully");
        timer.success();
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Grow the filesystem after a controller-side expansion. Block volumes
    /// need no node work: the kernel sees the new size via NVMe rescan.
    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("node_expand_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.volume_path.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        info!(
            volume_id = %req.volume_id,
            volume_path = %req.volume_path,
            "NodeExpandVolume request"
        );

        if Self::is_block_capability(req.volume_capability.as_ref()) {
            let requested = req
                .capacity_range
                .as_ref()
                .map(|r| r.required_bytes)
                .unwrap_or(0);
            timer.success();
            return Ok(Response::new(csi::NodeExpandVolumeResponse {
                capacity_bytes: requested,
            }));
        }

        let device = self
            .mounter
            .device_for_mount(&req.volume_path)
            .map_err(Self::map_mount_error)?
            .ok_or_else(|| {
                Status::failed_precondition(format!("no filesystem mounted at {}", req.volume_path))
            })?;
        let fs_type = self
            .mounter
            .detect_fs_type(&device)
            .await
            .map_err(Self::map_mount_error)?
            .ok_or_else(|| Status::internal("mounted device has no filesystem signature"))?;

        self.mounter
            .expand(&fs_type, &device, &req.volume_path)
            .await
            .map_err(Self::map_mount_error)?;

        let stats = self
            .mounter
            .stats(&req.volume_path)
            .map_err(Self::map_mount_error)?;

        info!(
            volume_id = %req.volume_id,
            capacity_bytes = stats.total_bytes,
            "Volume expansion completed"
        );
        timer.success();
        Ok(Response::new(csi::NodeExpandVolumeResponse {
            capacity_bytes: stats.total_bytes as i64,
        }))
    }

    /// Filesystem usage for mounted volumes; raw device size for block
    /// volumes.
    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volume path is required"));
        }
        Self::validate_path(&req.volume_path)?;

        if !Path::new(&req.volume_path).exists() {
            return Err(Status::not_found(format!(
                "volume path {} does not exist",
                req.volume_path
            )));
        }

        // A block publish target is a device node bound over a file; report
        // the device size with no inode usage.
        if let Some(device) = self
            .mounter
            .device_for_mount(&req.volume_path)
            .map_err(Self::map_mount_error)?
            .filter(|device| device.starts_with("/dev/nvme"))
            && !Path::new(&req.volume_path).is_dir()
        {
            let size = Self::device_size_bytes(&device)?;
            return Ok(Response::new(csi::NodeGetVolumeStatsResponse {
                usage: vec![csi::VolumeUsage {
                    available: 0,
                    total: size,
                    used: 0,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                }],
                volume_condition: None,
            }));
        }

        let stats = self
            .mounter
            .stats(&req.volume_path)
            .map_err(Self::map_mount_error)?;

        Ok(Response::new(csi::NodeGetVolumeStatsResponse {
            usage: vec![
                csi::VolumeUsage {
                    available: stats.available_bytes as i64,
                    total: stats.total_bytes as i64,
                    used: stats.used_bytes as i64,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                },
                csi::VolumeUsage {
                    available: stats.free_inodes as i64,
                    total: stats.total_inodes as i64,
                    used: stats.used_inodes as i64,
                    unit: csi::volume_usage::Unit::Inodes as i32,
                },
            ],
            volume_condition: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use csi::node_service_capability::rpc::Type;

        let capabilities = [Type::StageUnstageVolume, Type::ExpandVolume, Type::GetVolumeStats]
            .into_iter()
            .map(|rpc_type| csi::NodeServiceCapability {
                r#type: Some(csi::node_service_capability::Type::Rpc(
                    csi::node_service_capability::Rpc {
                        r#type: rpc_type as i32,
                    },
                )),
            })
            .collect();

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        info!(node_id = %self.config.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: 0, // No limit
            accessible_topology: None,
        }))
    }
}
