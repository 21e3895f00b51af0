//! NVMe/TCP session handling on the node.
//!
//! Wraps nvme-cli for connect/disconnect and walks sysfs for device
//! discovery. Device resolution scans `/sys/class/block/` for namespace
//! devices (`nvmeXnY`) and never controller-scoped paths (`nvmeXcYnZ`):
//! with NVMe-over-fabrics several controllers can shadow one namespace and
//! only the namespace device is stable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;

#[derive(Error, Debug)]
pub enum NvmeError {
    #[error("'nvme {0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("nvme {operation} failed: {message}")]
    CommandFailed { operation: String, message: String },

    #[error("no namespace device appeared for nqn '{0}'")]
    DeviceNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, NvmeError>;

/// Per-operation timeouts, all overridable.
#[derive(Debug, Clone)]
pub struct NvmeConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub list_timeout: Duration,
    pub command_timeout: Duration,
    pub device_wait_timeout: Duration,
    pub healthcheck_interval: Duration,
}

impl Default for NvmeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(15),
            list_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(20),
            device_wait_timeout: Duration::from_secs(30),
            healthcheck_interval: Duration::from_secs(5),
        }
    }
}

struct InflightOp {
    operation: String,
    started: Instant,
    budget: Duration,
    flagged: bool,
}

#[derive(Clone)]
pub struct NvmeConnector {
    config: NvmeConfig,
    sysfs_block: PathBuf,
    sysfs_nvme: PathBuf,
    inflight: Arc<Mutex<HashMap<u64, InflightOp>>>,
    next_op_id: Arc<AtomicU64>,
}

impl NvmeConnector {
    pub fn new(config: NvmeConfig) -> Self {
        Self {
            config,
            sysfs_block: PathBuf::from("/sys/class/block"),
            sysfs_nvme: PathBuf::from("/sys/class/nvme"),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_op_id: Arc::new(AtomicU64::new(0)),
        }
    }

    #[cfg(test)]
    fn with_sysfs(config: NvmeConfig, sysfs_block: PathBuf, sysfs_nvme: PathBuf) -> Self {
        Self {
            config,
            sysfs_block,
            sysfs_nvme,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            next_op_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Background watchdog flagging operations that run past twice their
    /// timeout. Such operations indicate a wedged kernel command that the
    /// context timeout could not cancel.
    pub fn spawn_healthcheck(&self) -> JoinHandle<()> {
        let inflight = self.inflight.clone();
        let interval = self.config.healthcheck_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let mut ops = inflight.lock().await;
                for op in ops.values_mut() {
                    if !op.flagged && op.started.elapsed() > op.budget * 2 {
                        op.flagged = true;
                        warn!(
                            operation = %op.operation,
                            elapsed_secs = op.started.elapsed().as_secs(),
                            "NVMe operation appears stuck"
                        );
                        metrics::record_nvme_stuck(&op.operation);
                    }
                }
            }
        })
    }

    async fn track_op(&self, operation: &str, budget: Duration) -> u64 {
        let id = self.next_op_id.fetch_add(1, Ordering::Relaxed);
        self.inflight.lock().await.insert(
            id,
            InflightOp {
                operation: operation.to_string(),
                started: Instant::now(),
                budget,
                flagged: false,
            },
        );
        id
    }

    async fn finish_op(&self, id: u64) {
        self.inflight.lock().await.remove(&id);
    }

    async fn run_nvme(&self, operation: &str, args: &[&str], timeout: Duration) -> Result<String> {
        let op_id = self.track_op(operation, timeout).await;
        let started = Instant::now();

        let result = tokio::time::timeout(timeout, Command::new("nvme").args(args).output()).await;
        self.finish_op(op_id).await;
        let duration = started.elapsed().as_secs_f64();

        let output = match result {
            Ok(output) => output?,
            Err(_) => {
                metrics::record_nvme_timeout(operation);
                metrics::record_nvme_operation(operation, "timeout", duration);
                return Err(NvmeError::Timeout(operation.to_string(), timeout));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            metrics::record_nvme_operation(operation, "error", duration);
            return Err(NvmeError::CommandFailed {
                operation: operation.to_string(),
                message: stderr,
            });
        }

        metrics::record_nvme_operation(operation, "success", duration);
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Connect to an NVMe/TCP target and wait for its namespace device.
    pub async fn connect(&self, address: &str, port: u16, nqn: &str) -> Result<String> {
        info!(address = %address, port = port, nqn = %nqn, "Connecting NVMe/TCP target");

        let port_str = port.to_string();
        let args = ["connect", "-t", "tcp", "-a", address, "-s", &port_str, "-n", nqn];
        match self.run_nvme("connect", &args, self.config.connect_timeout).await {
            Ok(_) => {}
            Err(NvmeError::CommandFailed { message, .. })
                if message.contains("already connected") =>
            {
                debug!(nqn = %nqn, "NVMe target already connected");
            }
            Err(e) => return Err(e),
        }

        let device = self.wait_for_device(nqn).await?;
        info!(nqn = %nqn, device = %device, "NVMe/TCP target connected");
        Ok(device)
    }

    /// Disconnect an NVMe/TCP session. Idempotent: an NQN with no
    /// controllers is already disconnected.
    pub async fn disconnect(&self, nqn: &str) -> Result<()> {
        info!(nqn = %nqn, "Disconnecting NVMe/TCP target");

        match self
            .run_nvme("disconnect", &["disconnect", "-n", nqn], self.config.disconnect_timeout)
            .await
        {
            Ok(output) => {
                if output.contains("disconnected 0") {
                    debug!(nqn = %nqn, "No controllers for nqn; already disconnected");
                }
                Ok(())
            }
            Err(NvmeError::CommandFailed { message, .. })
                if message.contains("no controllers") || message.contains("not found") =>
            {
                debug!(nqn = %nqn, "NVMe target already disconnected");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Whether any active controller claims the NQN. Walks sysfs rather
    /// than trusting cached state.
    pub fn is_connected(&self, nqn: &str) -> bool {
        self.controller_nqns()
            .map(|nqns| nqns.iter().any(|candidate| candidate == nqn))
            .unwrap_or(false)
    }

    /// Connected NQNs starting with the given prefix. Used by the orphan
    /// cleaner at node startup.
    pub fn list_connections_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut matching: Vec<String> = self
            .controller_nqns()?
            .into_iter()
            .filter(|nqn| nqn.starts_with(prefix))
            .collect();
        matching.sort();
        matching.dedup();
        Ok(matching)
    }

    fn controller_nqns(&self) -> Result<Vec<String>> {
        let mut nqns = Vec::new();
        let entries = match std::fs::read_dir(&self.sysfs_nvme) {
            Ok(entries) => entries,
            // No NVMe subsystem loaded means no connections.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(nqns),
            Err(e) => return Err(e.into()),
        };
        for entry in entries.flatten() {
            let subsysnqn = entry.path().join("subsysnqn");
            if let Ok(nqn) = std::fs::read_to_string(subsysnqn) {
                nqns.push(nqn.trim().to_string());
            }
        }
        Ok(nqns)
    }

    /// Resolve the namespace block device for an NQN, or None if it has not
    /// appeared yet.
    pub fn find_device(&self, nqn: &str) -> Result<Option<String>> {
        let entries = match std::fs::read_dir(&self.sysfs_block) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_namespace_device(&name) {
                continue;
            }
            let subsysnqn = entry.path().join("device/subsysnqn");
            if let Ok(found) = std::fs::read_to_string(subsysnqn)
                && found.trim() == nqn
            {
                return Ok(Some(format!("/dev/{}", name)));
            }
        }
        Ok(None)
    }

    async fn wait_for_device(&self, nqn: &str) -> Result<String> {
        let deadline = Instant::now() + self.config.device_wait_timeout;
        loop {
            if let Some(device) = self.find_device(nqn)? {
                return Ok(device);
            }
            if Instant::now() >= deadline {
                metrics::record_nvme_timeout("device_wait");
                return Err(NvmeError::DeviceNotFound(nqn.to_string()));
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// `nvmeXnY` is a namespace device; `nvmeX` is a controller and `nvmeXcYnZ`
/// a controller-scoped namespace path that multipath setups shadow.
pub fn is_namespace_device(name: &str) -> bool {
    let Some(rest) = name.strip_prefix("nvme") else {
        return false;
    };
    let mut chars = rest.chars().peekable();

    if !chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
    }

    if chars.next() != Some('n') {
        return false;
    }

    if !chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        return false;
    }
    while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
        chars.next();
    }

    // Anything left over (partitions, controller infixes) disqualifies.
    chars.next().is_none()
}
