//! CSI Controller Service Implementation
//!
//! Volume and snapshot lifecycle against the RDS, plus attachment tracking
//! for ControllerPublish/Unpublish fencing.

use std::collections::HashMap;
use std::sync::Arc;

use prost_types::Timestamp;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info};

use rds_client::ident::{
    self, SNAPSHOT_PREFIX, VOLUME_PREFIX, derive_nqn, slot_for_volume_name, snapshot_slot_stem,
    snapshot_slot_timestamp, validate_port, validate_slot, validate_snapshot_slot,
};
use rds_client::{RdsError, VolumeBackend};

use crate::attachment::{AttachmentError, AttachmentManager};
use crate::clock::Clock;
use crate::config::{DriverConfig, MAX_VOLUME_SIZE, MIN_VOLUME_SIZE};
use crate::csi;
use crate::metrics::OperationTimer;

/// StorageClass parameter keys recognized by CreateVolume.
const PARAM_FS_TYPE: &str = "fsType";
const PARAM_VOLUME_PATH: &str = "volumePath";
const PARAM_NVME_ADDRESS: &str = "nvmeAddress";
const PARAM_NVME_PORT: &str = "nvmePort";
const PARAM_NQN_PREFIX: &str = "nqnPrefix";
/// Accepted for StorageClass compatibility; the management connection is
/// fixed at bootstrap, so only the port bounds are checked here.
const PARAM_SSH_PORT: &str = "sshPort";

/// Volume context keys handed to the node service.
const CTX_NVME_ADDRESS: &str = "nvmeAddress";
const CTX_NVME_PORT: &str = "nvmePort";
const CTX_NQN: &str = "nqn";
const CTX_FS_TYPE: &str = "fsType";

/// Requested access shape, distilled from the CSI capability list.
#[derive(Debug, Clone, PartialEq, Eq)]
struct AccessProfile {
    block: bool,
    multi_node: bool,
    /// fs_type from the mount capability; overrides the StorageClass one.
    fs_type: Option<String>,
}

/// Per-volume provisioning parameters after defaulting and validation.
#[derive(Debug, Clone)]
struct VolumeParams {
    fs_type: String,
    volume_path: String,
    nvme_address: String,
    nvme_port: u16,
    nqn_prefix: String,
}

/// CSI Controller Service
///
/// Implements the CSI Controller service which handles:
/// - Volume creation, deletion and expansion on the RDS
/// - Snapshot creation, deletion and listing
/// - Attachment tracking with single-writer fencing
/// - Capacity and volume enumeration
pub struct ControllerService {
    backend: Arc<dyn VolumeBackend>,
    attachments: Arc<AttachmentManager>,
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    /// Snapshot slot names no longer embed the source volume, so the source
    /// pointer lives in this secondary index. Entries reappear on the first
    /// idempotent CreateSnapshot after a restart; they are never guessed
    /// from the slot name.
    snapshot_sources: RwLock<HashMap<String, String>>,
}

impl ControllerService {
    pub fn new(
        backend: Arc<dyn VolumeBackend>,
        attachments: Arc<AttachmentManager>,
        config: DriverConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            backend,
            attachments,
            config,
            clock,
            snapshot_sources: RwLock::new(HashMap::new()),
        }
    }

    /// Translate RDS errors into CSI status codes, keeping device details
    /// out of user-visible messages.
    fn map_rds_error(context: &str, e: RdsError) -> Status {
        error!(context = %context, error = %e, "RDS operation failed");
        match e {
            RdsError::VolumeNotFound(slot) => {
                Status::not_found(format!("volume '{}' not found", slot))
            }
            RdsError::SnapshotNotFound(slot) => {
                Status::not_found(format!("snapshot '{}' not found", slot))
            }
            RdsError::AlreadyExists(slot) => {
                Status::already_exists(format!("volume '{}' already exists", slot))
            }
            RdsError::OutOfSpace(_) => Status::resource_exhausted("not enough space on storage"),
            RdsError::InvalidArgument(msg) => Status::invalid_argument(msg),
            RdsError::ValidationBudgetExceeded => {
                Status::invalid_argument("input failed validation")
            }
            RdsError::Timeout(_) => Status::deadline_exceeded("storage operation timed out"),
            RdsError::NotConnected | RdsError::Ssh(_) | RdsError::Io(_) => {
                Status::unavailable("storage backend unreachable")
            }
            RdsError::HostKeyMismatch(_) => {
                Status::unavailable("storage backend identity could not be verified")
            }
            RdsError::CommandFailed(_) | RdsError::Parse(_) => {
                Status::internal("storage operation failed")
            }
        }
    }

    fn map_attachment_error(e: AttachmentError) -> Status {
        match e {
            AttachmentError::Fencing { slot, holder } => Status::failed_precondition(format!(
                "volume '{}' is attached to node '{}'",
                slot, holder
            )),
            AttachmentError::HandoffInProgress { slot } => Status::failed_precondition(format!(
                "volume '{}' already has a migration in progress",
                slot
            )),
            AttachmentError::Rebuild(e) => {
                error!(error = %e, "Attachment rebuild error surfaced in request path");
                Status::internal("attachment state unavailable")
            }
        }
    }

    /// Distill the capability list into an access profile, rejecting
    /// combinations this driver cannot serve. Filesystem volumes are
    /// single-node only; block volumes may be multi-node (live migration).
    fn validate_capabilities(capabilities: &[csi::VolumeCapability]) -> Result<AccessProfile, Status> {
        use csi::volume_capability::access_mode::Mode;

        if capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }

        let mut profile: Option<AccessProfile> = None;
        for capability in capabilities {
            let mode = capability
                .access_mode
                .as_ref()
                .map(|m| m.mode())
                .ok_or_else(|| Status::invalid_argument("access mode is required"))?;

            let multi_node = matches!(
                mode,
                Mode::MultiNodeReaderOnly | Mode::MultiNodeSingleWriter | Mode::MultiNodeMultiWriter
            );
            if mode == Mode::Unknown {
                return Err(Status::invalid_argument("unknown access mode"));
            }

            let (block, fs_type) = match &capability.access_type {
                Some(csi::volume_capability::AccessType::Block(_)) => (true, None),
                Some(csi::volume_capability::AccessType::Mount(mount)) => {
                    let fs_type = if mount.fs_type.is_empty() {
                        None
                    } else {
                        Some(mount.fs_type.clone())
                    };
                    (false, fs_type)
                }
                None => return Err(Status::invalid_argument("access type is required")),
            };

            if !block && multi_node {
                return Err(Status::invalid_argument(
                    "multi-node access requires block volume mode",
                ));
            }

            let candidate = AccessProfile {
                block,
                multi_node,
                fs_type,
            };
            match &profile {
                None => profile = Some(candidate),
                Some(existing) if *existing == candidate => {}
                Some(_) => {
                    return Err(Status::invalid_argument(
                        "conflicting volume capabilities in one request",
                    ));
                }
            }
        }

        Ok(profile.expect("non-empty capability list"))
    }

    /// Required size from the capacity range, bounded to what the RDS can
    /// reasonably back with one file.
    fn required_size(capacity_range: Option<&csi::CapacityRange>) -> Result<u64, Status> {
        let (required, limit) = match capacity_range {
            Some(range) => (range.required_bytes, range.limit_bytes),
            None => (0, 0),
        };
        if required < 0 || limit < 0 {
            return Err(Status::invalid_argument("capacity must not be negative"));
        }

        let size = if required > 0 {
            required as u64
        } else if limit > 0 {
            limit as u64
        } else {
            MIN_VOLUME_SIZE
        };

        if size < MIN_VOLUME_SIZE {
            return Err(Status::invalid_argument(format!(
                "requested size {} is below the {} byte minimum",
                size, MIN_VOLUME_SIZE
            )));
        }
        if size > MAX_VOLUME_SIZE {
            return Err(Status::invalid_argument(format!(
                "requested size {} exceeds the {} byte maximum",
                size, MAX_VOLUME_SIZE
            )));
        }
        if limit > 0 && size > limit as u64 {
            return Err(Status::invalid_argument(
                "required bytes exceed the capacity limit",
            ));
        }

        Ok(size)
    }

    /// StorageClass parameters with driver defaults, validated.
    fn volume_params(&self, parameters: &HashMap<String, String>) -> Result<VolumeParams, Status> {
        let fs_type = parameters
            .get(PARAM_FS_TYPE)
            .cloned()
            .unwrap_or_else(|| self.config.fs_type.clone());

        let volume_path = parameters
            .get(PARAM_VOLUME_PATH)
            .cloned()
            .unwrap_or_else(|| self.config.volume_base_path_str());

        let nvme_address = parameters
            .get(PARAM_NVME_ADDRESS)
            .cloned()
            .unwrap_or_else(|| self.config.rds_address.clone());
        ident::validate_ipv4(&nvme_address)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let nvme_port = match parameters.get(PARAM_NVME_PORT) {
            Some(raw) => {
                let port: u32 = raw
                    .parse()
                    .map_err(|_| Status::invalid_argument(format!("malformed nvmePort '{}'", raw)))?;
                validate_port(port, false).map_err(|e| Status::invalid_argument(e.to_string()))?
            }
            None => self.config.nvme_port,
        };

        let nqn_prefix = parameters
            .get(PARAM_NQN_PREFIX)
            .cloned()
            .unwrap_or_else(|| self.config.nqn_prefix.clone());
        ident::validate_nqn_prefix(&nqn_prefix)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        if let Some(raw) = parameters.get(PARAM_SSH_PORT) {
            let port: u32 = raw
                .parse()
                .map_err(|_| Status::invalid_argument(format!("malformed sshPort '{}'", raw)))?;
            validate_port(port, false).map_err(|e| Status::invalid_argument(e.to_string()))?;
        }

        Ok(VolumeParams {
            fs_type,
            volume_path,
            nvme_address,
            nvme_port,
            nqn_prefix,
        })
    }

    fn volume_context(params: &VolumeParams, nqn: &str) -> HashMap<String, String> {
        let mut context = HashMap::new();
        context.insert(CTX_NVME_ADDRESS.to_string(), params.nvme_address.clone());
        context.insert(CTX_NVME_PORT.to_string(), params.nvme_port.to_string());
        context.insert(CTX_NQN.to_string(), nqn.to_string());
        context.insert(CTX_FS_TYPE.to_string(), params.fs_type.clone());
        context
    }

    fn csi_volume(
        volume: &rds_client::RdsVolume,
        params: &VolumeParams,
        content_source: Option<csi::VolumeContentSource>,
    ) -> csi::Volume {
        csi::Volume {
            capacity_bytes: volume.size_bytes as i64,
            volume_id: volume.slot.clone(),
            volume_context: Self::volume_context(params, &volume.nqn),
            content_source,
            accessible_topology: vec![],
        }
    }

    async fn csi_snapshot(&self, snapshot: &rds_client::RdsSnapshot) -> csi::Snapshot {
        let source_volume_id = self
            .snapshot_sources
            .read()
            .await
            .get(&snapshot.slot)
            .cloned()
            .or_else(|| snapshot.source_slot.clone())
            .unwrap_or_default();
        let creation_time = snapshot_slot_timestamp(&snapshot.slot).map(|secs| Timestamp {
            seconds: secs as i64,
            nanos: 0,
        });

        csi::Snapshot {
            size_bytes: snapshot.size_bytes as i64,
            snapshot_id: snapshot.slot.clone(),
            source_volume_id,
            creation_time,
            ready_to_use: true,
            group_snapshot_id: String::new(),
        }
    }

    /// An existing slot satisfies an idempotent retry only when it matches
    /// the request byte-exactly; anything else is a name collision.
    fn matches_existing(
        existing: &rds_client::RdsVolume,
        size_bytes: u64,
        nqn: &str,
    ) -> bool {
        existing.size_bytes == size_bytes && existing.nqn == nqn && existing.nvme_export
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    /// Create a new volume, or return the existing one for an idempotent
    /// retry.
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("create_volume");

        if req.name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume name is required"));
        }

        let profile = Self::validate_capabilities(&req.volume_capabilities).inspect_err(|_| {
            debug!(name = %req.name, "CreateVolume rejected at capability validation");
        })?;
        let size_bytes = Self::required_size(req.capacity_range.as_ref())?;
        let mut params = self.volume_params(&req.parameters)?;
        if let Some(fs_type) = &profile.fs_type {
            params.fs_type = fs_type.clone();
        }

        let slot = slot_for_volume_name(&req.name);
        let nqn = derive_nqn(&params.nqn_prefix, &slot)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(
            name = %req.name,
            slot = %slot,
            size_bytes = size_bytes,
            block = profile.block,
            "CreateVolume request"
        );

        let _slot_guard = self.attachments.lock_slot(&slot).await;

        match self.backend.get_volume(&slot).await {
            Ok(existing) => {
                return if Self::matches_existing(&existing, size_bytes, &nqn) {
                    info!(slot = %slot, "Volume already exists with matching parameters");
                    timer.success();
                    Ok(Response::new(csi::CreateVolumeResponse {
                        volume: Some(Self::csi_volume(&existing, &params, req.volume_content_source)),
                    }))
                } else {
                    timer.failure("already_exists");
                    Err(Status::already_exists(format!(
                        "volume '{}' exists with different parameters",
                        slot
                    )))
                };
            }
            Err(RdsError::VolumeNotFound(_)) => {}
            Err(e) => {
                timer.failure("backend_error");
                return Err(Self::map_rds_error("create_volume", e));
            }
        }

        let snapshot_source = match &req.volume_content_source {
            Some(csi::VolumeContentSource {
                r#type: Some(csi::volume_content_source::Type::Snapshot(snapshot)),
            }) => Some(snapshot.snapshot_id.clone()),
            Some(csi::VolumeContentSource {
                r#type: Some(csi::volume_content_source::Type::Volume(_)),
            }) => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument(
                    "volume cloning is not supported",
                ));
            }
            _ => None,
        };

        let created = match &snapshot_source {
            Some(snapshot_id) => {
                validate_snapshot_slot(snapshot_id)
                    .map_err(|e| Status::invalid_argument(e.to_string()))?;
                // A restore from a missing snapshot must report NotFound,
                // not surface as a failed copy.
                if let Err(e) = self.backend.get_snapshot(snapshot_id).await {
                    timer.failure("snapshot_missing");
                    return Err(Self::map_rds_error("create_volume", e));
                }
                self.backend
                    .restore_volume(
                        &slot,
                        snapshot_id,
                        &params.volume_path,
                        size_bytes,
                        params.nvme_port,
                        &nqn,
                    )
                    .await
            }
            None => {
                self.backend
                    .create_volume(&slot, &params.volume_path, size_bytes, params.nvme_port, &nqn)
                    .await
            }
        };

        let volume = match created {
            Ok(volume) => volume,
            Err(e) => {
                timer.failure("backend_error");
                return Err(Self::map_rds_error("create_volume", e));
            }
        };

        info!(slot = %slot, size_bytes = volume.size_bytes, "Volume created");
        timer.success();
        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(Self::csi_volume(&volume, &params, req.volume_content_source)),
        }))
    }

    /// Delete a volume. Success when already absent.
    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("delete_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        validate_slot(&req.volume_id).map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(volume_id = %req.volume_id, "DeleteVolume request");

        let _slot_guard = self.attachments.lock_slot(&req.volume_id).await;
        let volume_path = self.config.volume_base_path_str();
        if let Err(e) = self.backend.delete_volume(&req.volume_id, &volume_path).await {
            timer.failure("backend_error");
            return Err(Self::map_rds_error("delete_volume", e));
        }

        timer.success();
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    /// Grow a volume; shrink requests are rejected by the backend.
    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("controller_expand_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        validate_slot(&req.volume_id).map_err(|e| Status::invalid_argument(e.to_string()))?;
        let size_bytes = Self::required_size(req.capacity_range.as_ref())?;

        // Block volumes pick up the new size through an NVMe rescan; only
        // filesystem volumes need the node-side grow pass.
        let node_expansion_required = match &req.volume_capability {
            Some(capability) => !matches!(
                capability.access_type,
                Some(csi::volume_capability::AccessType::Block(_))
            ),
            None => true,
        };

        info!(
            volume_id = %req.volume_id,
            size_bytes = size_bytes,
            "ControllerExpandVolume request"
        );

        let _slot_guard = self.attachments.lock_slot(&req.volume_id).await;
        let new_size = match self.backend.resize_volume(&req.volume_id, size_bytes).await {
            Ok(size) => size,
            Err(e) => {
                timer.failure("backend_error");
                return Err(Self::map_rds_error("controller_expand_volume", e));
            }
        };

        timer.success();
        Ok(Response::new(csi::ControllerExpandVolumeResponse {
            capacity_bytes: new_size as i64,
            node_expansion_required,
        }))
    }

    /// Track the attachment; fencing violations surface as
    /// FailedPrecondition for the orchestrator to retry elsewhere.
    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("controller_publish_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        if req.node_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("node ID is required"));
        }
        validate_slot(&req.volume_id).map_err(|e| Status::invalid_argument(e.to_string()))?;

        let profile = match &req.volume_capability {
            Some(capability) => Self::validate_capabilities(std::slice::from_ref(capability))?,
            None => {
                timer.failure("invalid_argument");
                return Err(Status::invalid_argument("volume capability is required"));
            }
        };

        info!(
            volume_id = %req.volume_id,
            node_id = %req.node_id,
            block = profile.block,
            "ControllerPublishVolume request"
        );

        let _slot_guard = self.attachments.lock_slot(&req.volume_id).await;

        if let Err(e) = self.backend.get_volume(&req.volume_id).await {
            timer.failure("backend_error");
            return Err(Self::map_rds_error("controller_publish_volume", e));
        }

        let multi_node_block = profile.block && profile.multi_node;
        if let Err(e) = self
            .attachments
            .track(&req.volume_id, &req.node_id, multi_node_block)
            .await
        {
            timer.failure("fenced");
            return Err(Self::map_attachment_error(e));
        }

        timer.success();
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    /// Drop the attachment record. Always idempotent.
    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("controller_unpublish_volume");

        if req.volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("volume ID is required"));
        }
        validate_slot(&req.volume_id).map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(
            volume_id = %req.volume_id,
            node_id = %req.node_id,
            "ControllerUnpublishVolume request"
        );

        let _slot_guard = self.attachments.lock_slot(&req.volume_id).await;
        self.attachments.untrack(&req.volume_id, &req.node_id).await;

        timer.success();
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    /// Report which of the requested capabilities this driver supports.
    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();

        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume ID is required"));
        }
        validate_slot(&req.volume_id).map_err(|e| Status::invalid_argument(e.to_string()))?;

        self.backend
            .get_volume(&req.volume_id)
            .await
            .map_err(|e| Self::map_rds_error("validate_volume_capabilities", e))?;

        match Self::validate_capabilities(&req.volume_capabilities) {
            Ok(_) => Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                    mutable_parameters: req.mutable_parameters,
                }),
                message: String::new(),
            })),
            Err(status) => Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: status.message().to_string(),
            })),
        }
    }

    /// Enumerate driver-owned volumes with their published nodes.
    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();

        let mut volumes = self
            .backend
            .list_volumes(VOLUME_PREFIX)
            .await
            .map_err(|e| Self::map_rds_error("list_volumes", e))?;
        volumes.sort_by(|a, b| a.slot.cmp(&b.slot));

        let start = if req.starting_token.is_empty() {
            0
        } else {
            req.starting_token
                .parse::<usize>()
                .map_err(|_| Status::aborted("malformed starting token"))?
        };
        let max = if req.max_entries > 0 {
            req.max_entries as usize
        } else {
            volumes.len()
        };

        let mut entries = Vec::new();
        for volume in volumes.iter().skip(start).take(max) {
            let published_node_ids = match self.attachments.node_for(&volume.slot).await {
                Some(node) => vec![node],
                None => vec![],
            };
            entries.push(csi::list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    capacity_bytes: volume.size_bytes as i64,
                    volume_id: volume.slot.clone(),
                    volume_context: HashMap::new(),
                    content_source: None,
                    accessible_topology: vec![],
                }),
                status: Some(csi::list_volumes_response::VolumeStatus {
                    published_node_ids,
                    volume_condition: None,
                }),
            });
        }

        let next_token = if start + entries.len() < volumes.len() {
            (start + entries.len()).to_string()
        } else {
            String::new()
        };

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token,
        }))
    }

    /// Free space on the RDS disk backing the volume base path.
    async fn get_capacity(
        &self,
        request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        let req = request.into_inner();
        let params = self.volume_params(&req.parameters)?;

        let capacity = self
            .backend
            .get_capacity(&params.volume_path)
            .await
            .map_err(|e| Self::map_rds_error("get_capacity", e))?;

        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: capacity.free_bytes as i64,
            maximum_volume_size: Some(MAX_VOLUME_SIZE as i64),
            minimum_volume_size: Some(MIN_VOLUME_SIZE as i64),
        }))
    }

    /// Report controller capabilities.
    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::ExpandVolume,
        ]
        .into_iter()
        .map(|rpc_type| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc {
                    r#type: rpc_type as i32,
                },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    /// Create a snapshot, idempotently for repeated (name, source) pairs.
    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("create_snapshot");

        if req.source_volume_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("source volume ID is required"));
        }
        if req.name.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("snapshot name is required"));
        }
        validate_slot(&req.source_volume_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let stem = snapshot_slot_stem(&req.name);
        let volume_path = req
            .parameters
            .get(PARAM_VOLUME_PATH)
            .cloned()
            .unwrap_or_else(|| self.config.volume_base_path_str());

        info!(
            name = %req.name,
            source_volume_id = %req.source_volume_id,
            "CreateSnapshot request"
        );

        let _slot_guard = self.attachments.lock_slot(&req.source_volume_id).await;

        // Same CSI name twice is idempotent; same name for a different
        // source is a conflict.
        let existing = self
            .backend
            .list_snapshots()
            .await
            .map_err(|e| Self::map_rds_error("create_snapshot", e))?
            .into_iter()
            .find(|snapshot| snapshot.slot.starts_with(&stem));

        if let Some(snapshot) = existing {
            let recorded_source = self.snapshot_sources.read().await.get(&snapshot.slot).cloned();
            if let Some(source) = recorded_source
                && source != req.source_volume_id
            {
                timer.failure("already_exists");
                return Err(Status::already_exists(format!(
                    "snapshot '{}' exists for a different source volume",
                    req.name
                )));
            }
            self.snapshot_sources
                .write()
                .await
                .insert(snapshot.slot.clone(), req.source_volume_id.clone());
            info!(snapshot = %snapshot.slot, "Snapshot already exists; idempotent");
            timer.success();
            let csi_snapshot = self.csi_snapshot(&snapshot).await;
            return Ok(Response::new(csi::CreateSnapshotResponse {
                snapshot: Some(csi_snapshot),
            }));
        }

        let snap_slot =
            ident::snapshot_slot_for_name(&req.name, self.clock.unix_timestamp());
        let snapshot = match self
            .backend
            .create_snapshot(&snap_slot, &req.source_volume_id, &volume_path)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                timer.failure("backend_error");
                return Err(Self::map_rds_error("create_snapshot", e));
            }
        };

        self.snapshot_sources
            .write()
            .await
            .insert(snapshot.slot.clone(), req.source_volume_id.clone());

        info!(snapshot = %snapshot.slot, "Snapshot created");
        timer.success();
        let csi_snapshot = self.csi_snapshot(&snapshot).await;
        Ok(Response::new(csi::CreateSnapshotResponse {
            snapshot: Some(csi_snapshot),
        }))
    }

    /// Delete a snapshot. Success when already absent.
    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        let timer = OperationTimer::new("delete_snapshot");

        if req.snapshot_id.is_empty() {
            timer.failure("invalid_argument");
            return Err(Status::invalid_argument("snapshot ID is required"));
        }
        validate_snapshot_slot(&req.snapshot_id)
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        info!(snapshot_id = %req.snapshot_id, "DeleteSnapshot request");

        let volume_path = self.config.volume_base_path_str();
        if let Err(e) = self
            .backend
            .delete_snapshot(&req.snapshot_id, &volume_path)
            .await
        {
            timer.failure("backend_error");
            return Err(Self::map_rds_error("delete_snapshot", e));
        }
        self.snapshot_sources.write().await.remove(&req.snapshot_id);

        timer.success();
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    /// Enumerate snapshots, optionally filtered as the CSI spec allows.
    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();

        let snapshots = self
            .backend
            .list_snapshots()
            .await
            .map_err(|e| Self::map_rds_error("list_snapshots", e))?;

        let mut entries = Vec::new();
        for snapshot in snapshots {
            debug_assert!(snapshot.slot.starts_with(SNAPSHOT_PREFIX));
            if !req.snapshot_id.is_empty() && snapshot.slot != req.snapshot_id {
                continue;
            }
            let csi_snapshot = self.csi_snapshot(&snapshot).await;
            if !req.source_volume_id.is_empty()
                && csi_snapshot.source_volume_id != req.source_volume_id
            {
                continue;
            }
            entries.push(csi::list_snapshots_response::Entry {
                snapshot: Some(csi_snapshot),
            });
        }

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries,
            next_token: String::new(),
        }))
    }

    /// Get volume (not implemented).
    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("ControllerGetVolume is not supported"))
    }

    /// Modify volume (not implemented).
    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "ControllerModifyVolume is not supported",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FixedClock;
    use crate::csi::controller_server::Controller;
    use crate::test_support::{FakeBackend, block_capability, mount_capability};
    use std::time::Duration;

    const GIB: i64 = 1 << 30;

    fn service(backend: Arc<FakeBackend>) -> ControllerService {
        let clock = FixedClock::at_unix(1_700_000_000);
        let attachments = Arc::new(AttachmentManager::new(Duration::from_secs(30), clock.clone()));
        let config = DriverConfig {
            rds_address: "192.0.2.10".to_string(),
            node_id: "controller".to_string(),
            ..DriverConfig::default()
        };
        ControllerService::new(backend, attachments, config, clock)
    }

    fn create_request(name: &str, size: i64, caps: Vec<csi::VolumeCapability>) -> csi::CreateVolumeRequest {
        csi::CreateVolumeRequest {
            name: name.to_string(),
            capacity_range: Some(csi::CapacityRange {
                required_bytes: size,
                limit_bytes: 0,
            }),
            volume_capabilities: caps,
            parameters: HashMap::new(),
            secrets: HashMap::new(),
            volume_content_source: None,
            accessibility_requirements: None,
        }
    }

    #[tokio::test]
    async fn test_create_volume_happy_path() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());

        let response = svc
            .create_volume(Request::new(create_request(
                "test-vol-1",
                5 * GIB,
                vec![mount_capability("ext4", false)],
            )))
            .await
            .unwrap()
            .into_inner();

        let volume = response.volume.unwrap();
        assert_eq!(volume.volume_id, slot_for_volume_name("test-vol-1"));
        assert_eq!(volume.capacity_bytes, 5 * GIB);
        assert_eq!(
            volume.volume_context.get("nqn").unwrap(),
            &format!("nqn.2000-02.com.mikrotik:{}", volume.volume_id)
        );
        assert_eq!(volume.volume_context.get("fsType").unwrap(), "ext4");
        assert_eq!(volume.volume_context.get("nvmePort").unwrap(), "4420");
    }

    #[tokio::test]
    async fn test_create_volume_is_idempotent() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let request = create_request("vol", 2 * GIB, vec![mount_capability("ext4", false)]);

        let first = svc
            .create_volume(Request::new(request.clone()))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        let second = svc
            .create_volume(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();

        assert_eq!(first.volume_id, second.volume_id);
        assert_eq!(first.capacity_bytes, second.capacity_bytes);
        assert_eq!(backend.volume_count(), 1);
    }

    #[tokio::test]
    async fn test_create_volume_conflicting_size_is_already_exists() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let err = svc
            .create_volume(Request::new(create_request(
                "vol",
                4 * GIB,
                vec![mount_capability("ext4", false)],
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);
    }

    #[tokio::test]
    async fn test_create_volume_size_bounds() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let caps = vec![mount_capability("ext4", false)];

        // Exactly 1 GiB accepted.
        svc.create_volume(Request::new(create_request("a", GIB, caps.clone())))
            .await
            .unwrap();
        // One byte below is rejected before any backend call.
        let err = svc
            .create_volume(Request::new(create_request("b", GIB - 1, caps.clone())))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);

        // Exactly 16 TiB accepted.
        svc.create_volume(Request::new(create_request("c", 16 * (1 << 40), caps.clone())))
            .await
            .unwrap();
        // One byte above is rejected.
        let err = svc
            .create_volume(Request::new(create_request("d", 16 * (1 << 40) + 1, caps)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_create_volume_rejects_rwx_filesystem_without_backend_call() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());

        let err = svc
            .create_volume(Request::new(create_request(
                "vol",
                2 * GIB,
                vec![mount_capability("ext4", true)],
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert_eq!(backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_create_volume_accepts_rwx_block() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());

        svc.create_volume(Request::new(create_request(
            "vm-disk",
            2 * GIB,
            vec![block_capability(true)],
        )))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_volume_out_of_space() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_free_bytes(GIB as u64);
        let svc = service(backend.clone());

        let err = svc
            .create_volume(Request::new(create_request(
                "vol",
                8 * GIB,
                vec![mount_capability("ext4", false)],
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn test_delete_volume_is_idempotent() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());

        let slot = slot_for_volume_name("vol");
        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let request = csi::DeleteVolumeRequest {
            volume_id: slot.clone(),
            secrets: HashMap::new(),
        };
        svc.delete_volume(Request::new(request.clone())).await.unwrap();
        assert_eq!(backend.volume_count(), 0);
        // Second delete of an absent volume is success.
        svc.delete_volume(Request::new(request)).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_volume_rejects_malformed_slot() {
        let svc = service(Arc::new(FakeBackend::default()));
        let err = svc
            .delete_volume(Request::new(csi::DeleteVolumeRequest {
                volume_id: "not-a-slot".to_string(),
                secrets: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_recreate_after_delete_reuses_slot() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let request = create_request("vol", 2 * GIB, vec![mount_capability("ext4", false)]);

        let first = svc
            .create_volume(Request::new(request.clone()))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        svc.delete_volume(Request::new(csi::DeleteVolumeRequest {
            volume_id: first.volume_id.clone(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
        assert!(backend.files_for_slot(&first.volume_id).is_empty());

        let second = svc
            .create_volume(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(first.volume_id, second.volume_id);
    }

    #[tokio::test]
    async fn test_expand_volume_and_shrink_rejection() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let slot = slot_for_volume_name("vol");

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let response = svc
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: slot.clone(),
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 4 * GIB,
                    limit_bytes: 0,
                }),
                secrets: HashMap::new(),
                volume_capability: Some(mount_capability("ext4", false)),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.capacity_bytes, 4 * GIB);
        assert!(response.node_expansion_required);

        let err = svc
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: slot,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 1 * GIB,
                    limit_bytes: 0,
                }),
                secrets: HashMap::new(),
                volume_capability: Some(mount_capability("ext4", false)),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_expand_block_volume_needs_no_node_expansion() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let slot = slot_for_volume_name("vm-disk");

        svc.create_volume(Request::new(create_request(
            "vm-disk",
            2 * GIB,
            vec![block_capability(false)],
        )))
        .await
        .unwrap();

        let response = svc
            .controller_expand_volume(Request::new(csi::ControllerExpandVolumeRequest {
                volume_id: slot,
                capacity_range: Some(csi::CapacityRange {
                    required_bytes: 4 * GIB,
                    limit_bytes: 0,
                }),
                secrets: HashMap::new(),
                volume_capability: Some(block_capability(false)),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(!response.node_expansion_required);
    }

    #[tokio::test]
    async fn test_publish_fencing_and_unpublish() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let slot = slot_for_volume_name("vol");

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let publish = |node: &str| csi::ControllerPublishVolumeRequest {
            volume_id: slot.clone(),
            node_id: node.to_string(),
            volume_capability: Some(mount_capability("ext4", false)),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        };

        svc.controller_publish_volume(Request::new(publish("node-a")))
            .await
            .unwrap();
        // Same node again: idempotent.
        svc.controller_publish_volume(Request::new(publish("node-a")))
            .await
            .unwrap();
        // Second node: fenced.
        let err = svc
            .controller_publish_volume(Request::new(publish("node-b")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        svc.controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: slot.clone(),
            node_id: "node-a".to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();

        // Now node-b can attach.
        svc.controller_publish_volume(Request::new(publish("node-b")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_block_live_migration_handoff() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let slot = slot_for_volume_name("vm-disk");

        svc.create_volume(Request::new(create_request(
            "vm-disk",
            2 * GIB,
            vec![block_capability(true)],
        )))
        .await
        .unwrap();

        let publish = |node: &str| csi::ControllerPublishVolumeRequest {
            volume_id: slot.clone(),
            node_id: node.to_string(),
            volume_capability: Some(block_capability(true)),
            readonly: false,
            secrets: HashMap::new(),
            volume_context: HashMap::new(),
        };

        svc.controller_publish_volume(Request::new(publish("node-a")))
            .await
            .unwrap();
        // Live migration: second node joins while the first drains.
        svc.controller_publish_volume(Request::new(publish("node-b")))
            .await
            .unwrap();
        // Third node is rejected.
        let err = svc
            .controller_publish_volume(Request::new(publish("node-c")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::FailedPrecondition);

        svc.controller_unpublish_volume(Request::new(csi::ControllerUnpublishVolumeRequest {
            volume_id: slot.clone(),
            node_id: "node-a".to_string(),
            secrets: HashMap::new(),
        }))
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_lifecycle() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let source = slot_for_volume_name("vol");

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let request = csi::CreateSnapshotRequest {
            source_volume_id: source.clone(),
            name: "nightly".to_string(),
            secrets: HashMap::new(),
            parameters: HashMap::new(),
        };
        let first = svc
            .create_snapshot(Request::new(request.clone()))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();
        assert!(first.snapshot_id.starts_with("snap-"));
        assert!(first.snapshot_id.contains("-at-"));
        assert_eq!(first.source_volume_id, source);
        assert_eq!(first.size_bytes, 2 * GIB);

        // Idempotent repeat returns the same handle.
        let second = svc
            .create_snapshot(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();
        assert_eq!(first.snapshot_id, second.snapshot_id);

        // Same name, different source: conflict.
        svc.create_volume(Request::new(create_request(
            "other",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();
        let err = svc
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: slot_for_volume_name("other"),
                name: "nightly".to_string(),
                secrets: HashMap::new(),
                parameters: HashMap::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::AlreadyExists);

        // List finds it with the recorded source.
        let listed = svc
            .list_snapshots(Request::new(csi::ListSnapshotsRequest {
                max_entries: 0,
                starting_token: String::new(),
                source_volume_id: source.clone(),
                snapshot_id: String::new(),
                secrets: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.entries.len(), 1);

        // Delete twice: second is idempotent success.
        let delete = csi::DeleteSnapshotRequest {
            snapshot_id: first.snapshot_id.clone(),
            secrets: HashMap::new(),
        };
        svc.delete_snapshot(Request::new(delete.clone())).await.unwrap();
        svc.delete_snapshot(Request::new(delete)).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_from_snapshot() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let source = slot_for_volume_name("vol");

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();
        let snapshot = svc
            .create_snapshot(Request::new(csi::CreateSnapshotRequest {
                source_volume_id: source,
                name: "nightly".to_string(),
                secrets: HashMap::new(),
                parameters: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner()
            .snapshot
            .unwrap();

        // Restore into a larger volume.
        let mut request = create_request("restored", 4 * GIB, vec![mount_capability("ext4", false)]);
        request.volume_content_source = Some(csi::VolumeContentSource {
            r#type: Some(csi::volume_content_source::Type::Snapshot(
                csi::volume_content_source::SnapshotSource {
                    snapshot_id: snapshot.snapshot_id.clone(),
                },
            )),
        });
        let restored = svc
            .create_volume(Request::new(request))
            .await
            .unwrap()
            .into_inner()
            .volume
            .unwrap();
        assert_eq!(restored.capacity_bytes, 4 * GIB);
        assert!(restored.volume_context.contains_key("nqn"));

        // Restoring from a snapshot that does not exist is NotFound.
        let mut request = create_request("ghost", 2 * GIB, vec![mount_capability("ext4", false)]);
        request.volume_content_source = Some(csi::VolumeContentSource {
            r#type: Some(csi::volume_content_source::Type::Snapshot(
                csi::volume_content_source::SnapshotSource {
                    snapshot_id: "snap-123e4567-e89b-42d3-a456-426614174000-at-1".to_string(),
                },
            )),
        });
        let err = svc.create_volume(Request::new(request)).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn test_get_capacity_and_list_volumes() {
        let backend = Arc::new(FakeBackend::default());
        backend.set_free_bytes(100 * GIB as u64);
        let svc = service(backend.clone());

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let capacity = svc
            .get_capacity(Request::new(csi::GetCapacityRequest {
                volume_capabilities: vec![],
                parameters: HashMap::new(),
                accessible_topology: None,
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(capacity.available_capacity > 0);

        let listed = svc
            .list_volumes(Request::new(csi::ListVolumesRequest {
                max_entries: 0,
                starting_token: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(listed.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_volume_capabilities() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        let slot = slot_for_volume_name("vol");

        svc.create_volume(Request::new(create_request(
            "vol",
            2 * GIB,
            vec![mount_capability("ext4", false)],
        )))
        .await
        .unwrap();

        let response = svc
            .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
                volume_id: slot.clone(),
                volume_context: HashMap::new(),
                volume_capabilities: vec![mount_capability("ext4", false)],
                parameters: HashMap::new(),
                secrets: HashMap::new(),
                mutable_parameters: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.confirmed.is_some());

        // RWX filesystem: unsupported, reported via message not error.
        let response = svc
            .validate_volume_capabilities(Request::new(csi::ValidateVolumeCapabilitiesRequest {
                volume_id: slot,
                volume_context: HashMap::new(),
                volume_capabilities: vec![mount_capability("ext4", true)],
                parameters: HashMap::new(),
                secrets: HashMap::new(),
                mutable_parameters: HashMap::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(response.confirmed.is_none());
        assert!(!response.message.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_unavailable() {
        let backend = Arc::new(FakeBackend::default());
        let svc = service(backend.clone());
        backend.set_connected(false);

        let err = svc
            .create_volume(Request::new(create_request(
                "vol",
                2 * GIB,
                vec![mount_capability("ext4", false)],
            )))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn test_capability_validation_rules() {
        // Missing capabilities.
        assert!(ControllerService::validate_capabilities(&[]).is_err());
        // Missing access mode.
        let capability = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        assert!(ControllerService::validate_capabilities(&[capability]).is_err());
        // Block RWX allowed.
        let profile =
            ControllerService::validate_capabilities(&[block_capability(true)]).unwrap();
        assert!(profile.block && profile.multi_node);
        // Mount single-writer allowed.
        let profile =
            ControllerService::validate_capabilities(&[mount_capability("xfs", false)]).unwrap();
        assert!(!profile.block && !profile.multi_node);
        assert_eq!(profile.fs_type.as_deref(), Some("xfs"));
    }
}
