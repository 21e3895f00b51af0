//! RDS CSI Driver
//!
//! Kubernetes CSI driver that provisions file-backed NVMe/TCP volumes on a
//! MikroTik ROSE Data Server and attaches them to workloads.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use clap::Parser;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use rds_client::{
    ConnectionManager, ConnectionManagerConfig, RdsClient, SshTransport, TransportConfig,
    VolumeBackend,
};

use csi_driver::attachment::AttachmentManager;
use csi_driver::clock::system_clock;
use csi_driver::cluster::KubeClusterState;
use csi_driver::config::{DEFAULT_DRIVER_NAME, DriverConfig, OrphanConfig};
use csi_driver::controller::ControllerService;
use csi_driver::csi;
use csi_driver::identity::{IdentityService, ReadinessState};
use csi_driver::metrics;
use csi_driver::mount::Mounter;
use csi_driver::node::NodeService;
use csi_driver::nvme::{NvmeConfig, NvmeConnector};
use csi_driver::orphan_nvme::OrphanNvmeCleaner;
use csi_driver::reconciler::OrphanReconciler;

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "rds-csi-driver")]
#[command(about = "RDS CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix socket path)
    #[arg(long, default_value = "unix:///var/lib/kubelet/plugins/rds.csi.srvlab.io/csi.sock")]
    endpoint: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long, env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Driver name
    #[arg(long, default_value = DEFAULT_DRIVER_NAME)]
    driver_name: String,

    /// RDS management address
    #[arg(long, default_value = "")]
    rds_address: String,

    /// RDS SSH port
    #[arg(long, default_value = "22")]
    rds_port: u16,

    /// RDS SSH user
    #[arg(long, default_value = "csi")]
    rds_user: String,

    /// Path to the SSH private key for RDS access
    #[arg(long, default_value = "/etc/rds-csi/id_ed25519")]
    rds_key_file: PathBuf,

    /// Path to the expected RDS host public key (OpenSSH format).
    /// Required in controller mode unless --rds-insecure-skip-verify is set.
    #[arg(long)]
    rds_host_key: Option<PathBuf>,

    /// Skip RDS host key verification (explicit opt-in, not recommended)
    #[arg(long, default_value = "false")]
    rds_insecure_skip_verify: bool,

    /// RDS filesystem root for volume backing files
    #[arg(long, default_value = "/storage-pool/metal-csi")]
    rds_volume_base_path: PathBuf,

    /// Run in controller mode (enables controller service)
    #[arg(long, default_value = "false")]
    controller: bool,

    /// Run in node mode (enables node service)
    #[arg(long, default_value = "false")]
    node: bool,

    /// Enable the orphan reconciler (controller mode)
    #[arg(long, default_value = "false")]
    enable_orphan_reconciler: bool,

    /// Orphan sweep interval in seconds
    #[arg(long, default_value = "3600")]
    orphan_check_interval: u64,

    /// Minimum orphan age before deletion, in seconds
    #[arg(long, default_value = "300")]
    orphan_grace_period: u64,

    /// Report orphans without deleting them
    #[arg(long, default_value = "true")]
    orphan_dry_run: bool,

    /// Live-migration handoff grace period in seconds
    #[arg(long, default_value = "30")]
    attachment_grace_period: u64,

    /// Attachment reconcile interval in seconds
    #[arg(long, default_value = "300")]
    attachment_reconcile_interval: u64,

    /// Prometheus metrics listen address (empty disables)
    #[arg(long, default_value = ":9809")]
    metrics_address: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Parse an OpenSSH public key file ("<type> <base64> [comment]") into the
/// raw key blob ssh2 reports for the session host key.
fn read_host_key(path: &Path) -> Result<Vec<u8>, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read host key {}: {}", path.display(), e))?;
    let encoded = contents
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| format!("host key {} is not in OpenSSH format", path.display()))?;
    let blob = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("host key {} is not valid base64: {}", path.display(), e))?;
    Ok(blob)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if !args.controller && !args.node {
        return Err("at least one of --controller or --node is required".into());
    }

    if !args.metrics_address.is_empty() {
        let addr = if args.metrics_address.starts_with(':') {
            format!("0.0.0.0{}", args.metrics_address)
        } else {
            args.metrics_address.clone()
        };
        metrics::init_metrics(addr.parse()?).map_err(|e| format!("metrics init failed: {}", e))?;
    }

    // Determine node_id
    let node_id = match args.node_id.clone() {
        Some(id) => id,
        None => hostname::get()?.to_string_lossy().to_string(),
    };

    let driver_config = DriverConfig {
        driver_name: args.driver_name.clone(),
        node_id: node_id.clone(),
        rds_address: args.rds_address.clone(),
        volume_base_path: args.rds_volume_base_path.clone(),
        attachment_grace_period: Duration::from_secs(args.attachment_grace_period),
        attachment_reconcile_interval: Duration::from_secs(args.attachment_reconcile_interval),
        ..DriverConfig::default()
    };

    info!(
        driver_name = %args.driver_name,
        endpoint = %args.endpoint,
        node_id = %node_id,
        controller_mode = args.controller,
        node_mode = args.node,
        "Starting RDS CSI Driver"
    );

    let clock = system_clock();
    let readiness = Arc::new(ReadinessState::new());
    let identity = IdentityService::new(args.driver_name.clone(), readiness.clone());

    let mut connection_manager: Option<ConnectionManager> = None;
    let mut controller_service: Option<ControllerService> = None;

    if args.controller {
        if args.rds_address.is_empty() {
            return Err("--rds-address is required in controller mode".into());
        }

        // Refuse to talk to an unverified RDS unless explicitly overridden.
        let host_key = match (&args.rds_host_key, args.rds_insecure_skip_verify) {
            (Some(path), _) => Some(read_host_key(path)?),
            (None, true) => {
                warn!("RDS host key verification disabled by --rds-insecure-skip-verify");
                None
            }
            (None, false) => {
                return Err(
                    "--rds-host-key is required in controller mode (or pass --rds-insecure-skip-verify)"
                        .into(),
                );
            }
        };

        // An unreadable SSH key should fail startup, not the first volume.
        std::fs::metadata(&args.rds_key_file)
            .map_err(|e| format!("cannot read SSH key {}: {}", args.rds_key_file.display(), e))?;

        let transport_config = TransportConfig {
            address: args.rds_address.clone(),
            port: args.rds_port,
            user: args.rds_user.clone(),
            private_key_path: args.rds_key_file.clone(),
            host_key,
            insecure_skip_verify: args.rds_insecure_skip_verify,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
        };

        let mut transport = SshTransport::new(transport_config);
        if let Err(e) = transport.connect() {
            // The connection manager will keep retrying; volumes cannot be
            // provisioned until the RDS is reachable.
            warn!(error = %e, "Initial RDS connection failed");
        }
        let transport = Arc::new(tokio::sync::Mutex::new(transport));

        let backend: Arc<dyn VolumeBackend> = Arc::new(RdsClient::new(
            transport.clone(),
            vec![args.rds_volume_base_path.clone()],
        )?);

        let attachments = Arc::new(AttachmentManager::new(
            driver_config.attachment_grace_period,
            clock.clone(),
        ));

        // The orchestrator's VolumeAttachment objects are authoritative;
        // the in-memory map must be rebuilt before the first request.
        let kube_client = kube::Client::try_default()
            .await
            .map_err(|e| format!("kubernetes client init failed: {}", e))?;
        let cluster = Arc::new(KubeClusterState::new(kube_client, args.driver_name.clone()));
        attachments
            .initialize(cluster.as_ref())
            .await
            .map_err(|e| format!("attachment rebuild failed: {}", e))?;

        tokio::spawn(attachments.clone().reconcile_loop(
            cluster.clone(),
            driver_config.attachment_reconcile_interval,
        ));

        let mut manager = ConnectionManager::new(transport, ConnectionManagerConfig::default());
        let trigger = attachments.reconcile_trigger();
        manager.set_on_reconnect(Arc::new(move || {
            // Attachments may have moved while the RDS was unreachable.
            trigger.notify_one();
        }));
        manager.start();
        connection_manager = Some(manager);

        if args.enable_orphan_reconciler {
            let orphan_config = OrphanConfig {
                enabled: true,
                check_interval: Duration::from_secs(args.orphan_check_interval),
                grace_period: Duration::from_secs(args.orphan_grace_period),
                dry_run: args.orphan_dry_run,
            };
            let reconciler = Arc::new(OrphanReconciler::new(
                backend.clone(),
                cluster.clone(),
                attachments.clone(),
                driver_config.clone(),
                orphan_config,
                clock.clone(),
            ));
            tokio::spawn(reconciler.run());
        }

        // Per-volume throughput gauges from the device's one-shot traffic
        // monitor, for attached volumes only.
        let traffic_backend = backend.clone();
        let traffic_attachments = attachments.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                for attachment in traffic_attachments.list().await {
                    match traffic_backend.disk_traffic(&attachment.slot).await {
                        Ok(traffic) => metrics::record_volume_traffic(
                            &attachment.slot,
                            traffic.read_bytes_per_sec,
                            traffic.write_bytes_per_sec,
                        ),
                        Err(e) => {
                            tracing::debug!(slot = %attachment.slot, error = %e, "Disk traffic read failed")
                        }
                    }
                }
            }
        });

        controller_service = Some(ControllerService::new(
            backend,
            attachments,
            driver_config.clone(),
            clock.clone(),
        ));
    }

    let mut node_service: Option<NodeService> = None;
    if args.node {
        let nvme = NvmeConnector::new(NvmeConfig::default());
        nvme.spawn_healthcheck();
        let mounter = Mounter::default();

        // Recover from node restarts: drop driver-owned NVMe sessions that
        // no mount references before accepting stage requests.
        let cleaner = OrphanNvmeCleaner::new(
            nvme.clone(),
            mounter.clone(),
            driver_config.nqn_prefix.clone(),
        );
        let cleaned = cleaner.run().await;
        if cleaned > 0 {
            info!(cleaned = cleaned, "Disconnected orphaned NVMe sessions");
        }

        node_service = Some(NodeService::new(driver_config.clone(), mounter, nvme));
    }

    // Serve on the unix socket kubelet expects.
    let socket_path = args.endpoint.trim_start_matches("unix://").to_string();
    if Path::new(&socket_path).exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = Path::new(&socket_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    let incoming = UnixListenerStream::new(listener);

    info!(socket = %socket_path, "CSI server listening");
    readiness.set_ready(true);

    Server::builder()
        .add_service(csi::identity_server::IdentityServer::new(identity))
        .add_optional_service(
            controller_service.map(csi::controller_server::ControllerServer::new),
        )
        .add_optional_service(node_service.map(csi::node_server::NodeServer::new))
        .serve_with_incoming_shutdown(incoming, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    readiness.set_ready(false);
    if let Some(mut manager) = connection_manager {
        manager.stop().await;
    }
    info!("RDS CSI Driver stopped");
    Ok(())
}
