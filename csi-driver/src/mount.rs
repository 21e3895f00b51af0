//! Filesystem formatting, mounting and stats for the node service.
//!
//! External tools (blkid, mkfs, mount, umount, resize2fs, xfs_growfs) run
//! through `tokio::process` with a shared command timeout so a wedged device
//! can never hang a kubelet RPC forever.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use nix::sys::statvfs::statvfs;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum MountError {
    #[error("device '{device}' already formatted as {found}, requested {requested}")]
    FsMismatch {
        device: String,
        found: String,
        requested: String,
    },

    #[error("mount option '{0}' is not permitted")]
    ForbiddenOption(String),

    #[error("unsupported filesystem type '{0}'")]
    UnsupportedFsType(String),

    #[error("'{0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("{tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("mount of '{0}' did not appear in the mount table")]
    NotMounted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MountError>;

/// Mount options the driver will pass through to the kernel.
const ALLOWED_OPTIONS: &[&str] = &[
    "ro",
    "rw",
    "noatime",
    "nodiratime",
    "relatime",
    "strictatime",
    "lazytime",
    "sync",
    "dirsync",
    "discard",
    "nosuid",
    "nodev",
    "noexec",
    "_netdev",
];

/// Options that are rejected no matter what the request says.
const FORBIDDEN_OPTIONS: &[&str] = &["suid", "dev", "exec"];

/// Filesystems this driver knows how to create and grow.
pub const SUPPORTED_FS_TYPES: &[&str] = &["ext4", "ext3", "xfs"];

/// Filesystem usage as reported by statvfs.
#[derive(Debug, Clone, Copy)]
pub struct FsStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

#[derive(Debug, Clone)]
pub struct Mounter {
    command_timeout: Duration,
    /// Override for the mount table location, for tests.
    mounts_path: String,
}

impl Default for Mounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(20))
    }
}

impl Mounter {
    pub fn new(command_timeout: Duration) -> Self {
        Self {
            command_timeout,
            mounts_path: "/proc/mounts".to_string(),
        }
    }

    #[cfg(test)]
    fn with_mounts_path(command_timeout: Duration, mounts_path: String) -> Self {
        Self {
            command_timeout,
            mounts_path,
        }
    }

    async fn run_tool(&self, tool: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!(tool = %tool, args = ?args, "Running tool");
        let child = Command::new(tool).args(args).output();
        match tokio::time::timeout(self.command_timeout, child).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(MountError::Timeout(tool.to_string(), self.command_timeout)),
        }
    }

    async fn run_tool_checked(&self, tool: &str, args: &[&str]) -> Result<String> {
        let output = self.run_tool(tool, args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MountError::ToolFailed {
                tool: tool.to_string(),
                message: stderr.trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Filter requested mount options through the allow-list.
    ///
    /// `suid`, `dev` and `exec` are always rejected; anything not on the
    /// allow-list is rejected rather than silently dropped, so a
    /// StorageClass typo surfaces as an error instead of a surprise.
    pub fn filter_mount_options(&self, requested: &[String]) -> Result<Vec<String>> {
        let mut filtered = Vec::with_capacity(requested.len());
        for opt in requested {
            let opt = opt.trim();
            if opt.is_empty() {
                continue;
            }
            if FORBIDDEN_OPTIONS.contains(&opt) {
                return Err(MountError::ForbiddenOption(opt.to_string()));
            }
            if !ALLOWED_OPTIONS.contains(&opt) {
                return Err(MountError::ForbiddenOption(opt.to_string()));
            }
            if !filtered.iter().any(|existing| existing == opt) {
                filtered.push(opt.to_string());
            }
        }
        Ok(filtered)
    }

    pub fn validate_fs_type(fs_type: &str) -> Result<&str> {
        SUPPORTED_FS_TYPES
            .iter()
            .find(|supported| **supported == fs_type)
            .copied()
            .ok_or_else(|| MountError::UnsupportedFsType(fs_type.to_string()))
    }

    /// Existing filesystem signature on a device, if any.
    ///
    /// blkid exits 2 when no signature is present; that is the "fresh
    /// device" answer, not an error.
    pub async fn detect_fs_type(&self, device: &str) -> Result<Option<String>> {
        let output = self
            .run_tool("blkid", &["-o", "value", "-s", "TYPE", device])
            .await?;
        if !output.status.success() {
            return Ok(None);
        }
        let fs = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(if fs.is_empty() { None } else { Some(fs) })
    }

    /// Format the device if and only if it carries no filesystem signature.
    /// A device formatted with a different filesystem is never reformatted.
    pub async fn ensure_formatted(
        &self,
        device: &str,
        fs_type: &str,
        mkfs_opts: &[String],
    ) -> Result<()> {
        let fs_type = Self::validate_fs_type(fs_type)?;

        match self.detect_fs_type(device).await? {
            Some(found) if found == fs_type => {
                debug!(device = %device, fs_type = %fs_type, "Device already formatted");
                return Ok(());
            }
            Some(found) => {
                return Err(MountError::FsMismatch {
                    device: device.to_string(),
                    found,
                    requested: fs_type.to_string(),
                });
            }
            None => {}
        }

        info!(device = %device, fs_type = %fs_type, "Formatting device");
        let tool = format!("mkfs.{}", fs_type);
        let mut args: Vec<&str> = match fs_type {
            "ext4" | "ext3" => vec!["-F"],
            "xfs" => vec!["-f"],
            _ => vec![],
        };
        for opt in mkfs_opts {
            args.push(opt);
        }
        args.push(device);
        self.run_tool_checked(&tool, &args).await?;
        Ok(())
    }

    /// Mount a formatted device, confirming it landed in the mount table.
    pub async fn mount(
        &self,
        source: &str,
        target: &str,
        fs_type: &str,
        options: &[String],
    ) -> Result<()> {
        let fs_type = Self::validate_fs_type(fs_type)?;
        let options = self.filter_mount_options(options)?;

        if self.is_mounted(target)? {
            debug!(target = %target, "Already mounted");
            return Ok(());
        }

        create_dir_private(target)?;

        let opts = options.join(",");
        let mut args = vec!["-t", fs_type];
        if !opts.is_empty() {
            args.push("-o");
            args.push(&opts);
        }
        args.push(source);
        args.push(target);
        self.run_tool_checked("mount", &args).await?;

        if !self.is_mounted(target)? {
            return Err(MountError::NotMounted(target.to_string()));
        }
        info!(source = %source, target = %target, fs_type = %fs_type, "Mounted");
        Ok(())
    }

    /// Bind-mount a staged directory into a pod target. `nosuid,nodev,noexec`
    /// are enforced on the bind regardless of requested options.
    pub async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()> {
        let mut options = self.filter_mount_options(options)?;
        for required in ["nosuid", "nodev", "noexec"] {
            if !options.iter().any(|o| o == required) {
                options.push(required.to_string());
            }
        }

        if self.is_mounted(target)? {
            debug!(target = %target, "Already bind-mounted");
            return Ok(());
        }

        if Path::new(source).is_dir() {
            create_dir_private(target)?;
        } else {
            // Block-mode publish: the target is a regular file the device
            // node is bound over.
            if let Some(parent) = Path::new(target).parent() {
                create_dir_private(&parent.to_string_lossy())?;
            }
            if !Path::new(target).exists() {
                std::fs::File::create(target)?;
            }
        }

        self.run_tool_checked("mount", &["--bind", source, target]).await?;
        // The bind itself ignores -o; a remount applies the flags.
        let remount_opts = format!("remount,bind,{}", options.join(","));
        self.run_tool_checked("mount", &["-o", &remount_opts, target]).await?;

        if !self.is_mounted(target)? {
            return Err(MountError::NotMounted(target.to_string()));
        }
        info!(source = %source, target = %target, "Bind-mounted");
        Ok(())
    }

    /// Unmount a path. Not-mounted is success.
    pub async fn unmount(&self, target: &str) -> Result<()> {
        if !self.is_mounted(target)? {
            debug!(target = %target, "Path is not mounted, skipping unmount");
            return Ok(());
        }

        let output = self.run_tool("umount", &[target]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("not mounted") || stderr.contains("not a mount point") {
                warn!(target = %target, "Path was not mounted");
                return Ok(());
            }
            return Err(MountError::ToolFailed {
                tool: "umount".to_string(),
                message: stderr.trim().to_string(),
            });
        }
        info!(target = %target, "Unmounted");
        Ok(())
    }

    /// Whether a path appears as a mount point in the mount table.
    pub fn is_mounted(&self, target: &str) -> Result<bool> {
        let mounts = std::fs::read_to_string(&self.mounts_path)?;
        let target = target.trim_end_matches('/');
        Ok(mounts.lines().any(|line| {
            line.split_whitespace()
                .nth(1)
                .is_some_and(|mount_point| mount_point.trim_end_matches('/') == target)
        }))
    }

    /// Device mounted at a path, from the mount table.
    pub fn device_for_mount(&self, target: &str) -> Result<Option<String>> {
        let mounts = std::fs::read_to_string(&self.mounts_path)?;
        let target = target.trim_end_matches('/');
        for line in mounts.lines() {
            let mut fields = line.split_whitespace();
            let device = fields.next();
            let mount_point = fields.next();
            if mount_point.is_some_and(|m| m.trim_end_matches('/') == target) {
                return Ok(device.map(|d| d.to_string()));
            }
        }
        Ok(None)
    }

    /// Whether a block device backs any current mount.
    pub fn is_device_mounted(&self, device: &str) -> Result<bool> {
        let mounts = std::fs::read_to_string(&self.mounts_path)?;
        Ok(mounts
            .lines()
            .any(|line| line.split_whitespace().next() == Some(device)))
    }

    /// Filesystem usage via statvfs.
    pub fn stats(&self, path: &str) -> Result<FsStats> {
        let vfs = statvfs(path).map_err(|e| MountError::ToolFailed {
            tool: "statvfs".to_string(),
            message: e.to_string(),
        })?;

        let block_size = vfs.fragment_size() as u64;
        let total_bytes = vfs.blocks() as u64 * block_size;
        let available_bytes = vfs.blocks_available() as u64 * block_size;
        let free_bytes = vfs.blocks_free() as u64 * block_size;
        let total_inodes = vfs.files() as u64;
        let free_inodes = vfs.files_available() as u64;

        Ok(FsStats {
            total_bytes,
            available_bytes,
            used_bytes: total_bytes.saturating_sub(free_bytes),
            total_inodes,
            free_inodes,
            used_inodes: total_inodes.saturating_sub(free_inodes),
        })
    }

    /// Grow a mounted filesystem to fill its (already resized) device.
    pub async fn expand(&self, fs_type: &str, device: &str, mount_path: &str) -> Result<()> {
        match Self::validate_fs_type(fs_type)? {
            "ext4" | "ext3" => {
                self.run_tool_checked("resize2fs", &[device]).await?;
            }
            "xfs" => {
                self.run_tool_checked("xfs_growfs", &[mount_path]).await?;
            }
            other => return Err(MountError::UnsupportedFsType(other.to_string())),
        }
        info!(device = %device, mount_path = %mount_path, fs_type = %fs_type, "Filesystem grown");
        Ok(())
    }
}

/// Staging and target directories are driver-private.
fn create_dir_private(path: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
}
