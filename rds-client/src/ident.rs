//! Identifier derivation and validation.
//!
//! Everything that ends up on the RDS command line goes through this module
//! first. Shell metacharacter rejection happens here, at validation time, so
//! the command formatting layer only ever sees clean identifiers.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use uuid::Uuid;

use crate::error::{RdsError, Result};

/// Namespace for UUIDv5 slot derivation. Fixed so that the same CSI volume
/// name always hashes to the same slot, cluster-wide and across restarts.
const SLOT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1d, 0x6a, 0x42, 0x7c, 0x0b, 0x5e, 0x9a, 0xb3, 0x44, 0x1e, 0x72, 0x90, 0x5c, 0xd8, 0x21,
]);

/// Volume slot prefix used for all driver-provisioned volumes.
pub const VOLUME_PREFIX: &str = "pvc-";
/// Snapshot slot prefix.
pub const SNAPSHOT_PREFIX: &str = "snap-";

/// `pvc-` + canonical hyphenated UUID.
const SLOT_LEN: usize = 40;
/// RDS slot names cap out well below this; matches the CSI ID length bound.
const MAX_SNAPSHOT_ID_LEN: usize = 250;
/// NQN length bound from the NVMe base specification.
const MAX_NQN_LEN: usize = 223;

/// Hard cap applied before any regex runs. Oversized input is rejected
/// outright rather than matched.
const MAX_MATCH_INPUT: usize = 1024;
/// Wall-clock budget for a single validation match.
const MATCH_BUDGET_MS: u128 = 100;

static SLOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^pvc-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").unwrap()
});

static SNAPSHOT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^snap-[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}(-at-[0-9]{1,20})?$",
    )
    .unwrap()
});

static NQN_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^nqn\.[0-9]{4}-[0-9]{2}\.[a-z0-9](?:[a-z0-9.-]{0,200}[a-z0-9])?$").unwrap()
});

static NQN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^nqn\.[0-9]{4}-[0-9]{2}\.[a-z0-9.:_-]{1,210}$").unwrap());

static PATH_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]{1,255}$").unwrap());

/// Run a validation regex under the module's complexity guard: inputs past
/// the length cap never reach the matcher, and a match that overruns the
/// wall-clock budget is reported as its own error rather than silently
/// accepted.
pub fn guarded_match(re: &Regex, input: &str) -> Result<bool> {
    if input.len() > MAX_MATCH_INPUT {
        return Err(RdsError::InvalidArgument(format!(
            "input too long for validation ({} bytes)",
            input.len()
        )));
    }
    let start = Instant::now();
    let matched = re.is_match(input);
    if start.elapsed().as_millis() > MATCH_BUDGET_MS {
        tracing::warn!(
            pattern = %re.as_str(),
            input_len = input.len(),
            "validation exceeded time budget"
        );
        return Err(RdsError::ValidationBudgetExceeded);
    }
    Ok(matched)
}

/// Derive the stable volume slot for a CSI-supplied volume name.
pub fn slot_for_volume_name(name: &str) -> String {
    format!("{}{}", VOLUME_PREFIX, Uuid::new_v5(&SLOT_NAMESPACE, name.as_bytes()))
}

/// Derive the snapshot slot for a CSI-supplied snapshot name. The UUID comes
/// from the snapshot name (not the source volume), the suffix pins creation
/// time so repeated names remain distinguishable on the device.
pub fn snapshot_slot_for_name(name: &str, unix_ts: u64) -> String {
    format!(
        "{}{}-at-{}",
        SNAPSHOT_PREFIX,
        Uuid::new_v5(&SLOT_NAMESPACE, name.as_bytes()),
        unix_ts
    )
}

/// The stable part of a snapshot slot (without the timestamp suffix), used
/// to recognize an existing snapshot for the same CSI name.
pub fn snapshot_slot_stem(name: &str) -> String {
    format!("{}{}", SNAPSHOT_PREFIX, Uuid::new_v5(&SLOT_NAMESPACE, name.as_bytes()))
}

pub fn validate_slot(slot: &str) -> Result<()> {
    if slot.len() != SLOT_LEN || !guarded_match(&SLOT_RE, slot)? {
        return Err(RdsError::InvalidArgument(format!(
            "malformed volume id '{}'",
            slot
        )));
    }
    Ok(())
}

pub fn validate_snapshot_slot(slot: &str) -> Result<()> {
    if slot.len() > MAX_SNAPSHOT_ID_LEN || !guarded_match(&SNAPSHOT_RE, slot)? {
        return Err(RdsError::InvalidArgument(format!(
            "malformed snapshot id '{}'",
            slot
        )));
    }
    Ok(())
}

/// Unix timestamp recovered from a snapshot slot's `-at-<ts>` suffix.
pub fn snapshot_slot_timestamp(slot: &str) -> Option<u64> {
    slot.rsplit_once("-at-")?.1.parse().ok()
}

pub fn validate_nqn_prefix(prefix: &str) -> Result<()> {
    if prefix.len() > MAX_NQN_LEN || !guarded_match(&NQN_PREFIX_RE, prefix)? {
        return Err(RdsError::InvalidArgument(format!(
            "malformed nqn prefix '{}'",
            prefix
        )));
    }
    Ok(())
}

/// `<prefix>:<slot>`. The slot is validated by the caller; the combined NQN
/// is re-validated so the invariant holds no matter which path built it.
pub fn derive_nqn(prefix: &str, slot: &str) -> Result<String> {
    validate_nqn_prefix(prefix)?;
    let nqn = format!("{}:{}", prefix, slot);
    validate_nqn(&nqn)?;
    Ok(nqn)
}

pub fn validate_nqn(nqn: &str) -> Result<()> {
    if nqn.len() > MAX_NQN_LEN || !guarded_match(&NQN_RE, nqn)? {
        return Err(RdsError::InvalidArgument(format!("malformed nqn '{}'", nqn)));
    }
    Ok(())
}

pub fn validate_ipv4(addr: &str) -> Result<()> {
    let octets: Vec<&str> = addr.split('.').collect();
    if octets.len() != 4 {
        return Err(RdsError::InvalidArgument(format!(
            "malformed IPv4 address '{}'",
            addr
        )));
    }
    for octet in octets {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RdsError::InvalidArgument(format!(
                "malformed IPv4 address '{}'",
                addr
            )));
        }
        // Leading zeros are ambiguous (octal in some parsers); reject.
        if octet.len() > 1 && octet.starts_with('0') {
            return Err(RdsError::InvalidArgument(format!(
                "malformed IPv4 address '{}'",
                addr
            )));
        }
        let value: u32 = octet
            .parse()
            .map_err(|_| RdsError::InvalidArgument(format!("malformed IPv4 address '{}'", addr)))?;
        if value > 255 {
            return Err(RdsError::InvalidArgument(format!(
                "IPv4 octet out of range in '{}'",
                addr
            )));
        }
    }
    Ok(())
}

pub fn validate_port(port: u32, require_unprivileged: bool) -> Result<u16> {
    if port == 0 || port > 65535 {
        return Err(RdsError::InvalidArgument(format!(
            "port {} out of range [1, 65535]",
            port
        )));
    }
    if require_unprivileged && port < 1024 {
        return Err(RdsError::InvalidArgument(format!(
            "port {} is privileged",
            port
        )));
    }
    Ok(port as u16)
}

/// Characters that must never appear in anything destined for the RDS
/// command line.
const SHELL_METACHARACTERS: &[char] =
    &[';', '|', '&', '$', '`', '(', ')', '<', '>', '\n', '\r', '\t', ' ', '"', '\'', '\\', '*', '?'];

pub fn has_shell_metacharacters(s: &str) -> bool {
    s.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
}

/// Validates backing-file paths against a configured allow-list of base
/// directories. Carried as a struct field rather than process state so each
/// component gets exactly the roots it was configured with.
#[derive(Debug, Clone)]
pub struct PathValidator {
    allowed_bases: Vec<PathBuf>,
}

impl PathValidator {
    pub fn new(allowed_bases: Vec<PathBuf>) -> Result<Self> {
        if allowed_bases.is_empty() {
            return Err(RdsError::InvalidArgument(
                "path allow-list cannot be empty".to_string(),
            ));
        }
        for base in &allowed_bases {
            if !base.is_absolute() {
                return Err(RdsError::InvalidArgument(format!(
                    "allow-list base '{}' is not absolute",
                    base.display()
                )));
            }
        }
        Ok(Self { allowed_bases })
    }

    /// Accepts only absolute, lexically-clean paths made of conservative
    /// segments, rooted under one of the allowed bases.
    pub fn validate(&self, path: &str) -> Result<()> {
        if path.is_empty() {
            return Err(RdsError::InvalidArgument("path cannot be empty".to_string()));
        }
        if path.len() > MAX_MATCH_INPUT {
            return Err(RdsError::InvalidArgument(format!(
                "path too long ({} bytes)",
                path.len()
            )));
        }
        if has_shell_metacharacters(path) {
            return Err(RdsError::InvalidArgument(format!(
                "path '{}' contains forbidden characters",
                path
            )));
        }

        let p = Path::new(path);
        if !p.is_absolute() {
            return Err(RdsError::InvalidArgument(format!(
                "path '{}' is not absolute",
                path
            )));
        }

        let mut cleaned = PathBuf::from("/");
        for component in p.components() {
            match component {
                Component::RootDir => {}
                Component::Normal(seg) => {
                    let seg = seg.to_str().ok_or_else(|| {
                        RdsError::InvalidArgument(format!("path '{}' is not UTF-8", path))
                    })?;
                    if !guarded_match(&PATH_SEGMENT_RE, seg)? {
                        return Err(RdsError::InvalidArgument(format!(
                            "path segment '{}' contains forbidden characters",
                            seg
                        )));
                    }
                    cleaned.push(seg);
                }
                Component::CurDir | Component::ParentDir | Component::Prefix(_) => {
                    return Err(RdsError::InvalidArgument(format!(
                        "path '{}' contains traversal components",
                        path
                    )));
                }
            }
        }

        // Cleaned form must equal the input: no doubled slashes, no trailing
        // slash, nothing the lexical walk had to repair.
        if cleaned.as_os_str() != p.as_os_str() {
            return Err(RdsError::InvalidArgument(format!(
                "path '{}' is not in canonical form",
                path
            )));
        }

        if !self.allowed_bases.iter().any(|base| cleaned.starts_with(base)) {
            return Err(RdsError::InvalidArgument(format!(
                "path '{}' is outside the configured volume base paths",
                path
            )));
        }

        Ok(())
    }
}
