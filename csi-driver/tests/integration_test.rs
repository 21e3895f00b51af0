//! Integration tests for csi-driver
//!
//! These tests verify driver-level invariants without requiring an RDS
//! device, NVMe connectivity, or a Kubernetes API: identifier contracts,
//! mount option policy, device naming rules, and configuration defaults.

use std::time::Duration;

use csi_driver::config::{
    DEFAULT_DRIVER_NAME, DEFAULT_NQN_PREFIX, DEFAULT_NVME_PORT, DEFAULT_VOLUME_PATH,
    DriverConfig, MAX_VOLUME_SIZE, MIN_VOLUME_SIZE, OrphanConfig,
};
use csi_driver::mount::Mounter;
use csi_driver::nvme::is_namespace_device;

use rds_client::ident;

// ============================================================================
// Driver identity
// ============================================================================

/// CSI driver names must follow DNS naming conventions.
#[test]
fn test_driver_name() {
    assert!(DEFAULT_DRIVER_NAME.contains('.'));
    assert!(
        DEFAULT_DRIVER_NAME
            .chars()
            .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    );
}

#[test]
fn test_config_defaults_match_storage_class_contract() {
    let config = DriverConfig::default();
    assert_eq!(config.nvme_port, DEFAULT_NVME_PORT);
    assert_eq!(config.nqn_prefix, DEFAULT_NQN_PREFIX);
    assert_eq!(config.volume_base_path_str(), DEFAULT_VOLUME_PATH);
    assert_eq!(config.fs_type, "ext4");
    assert_eq!(config.attachment_grace_period, Duration::from_secs(30));
    assert_eq!(config.attachment_reconcile_interval, Duration::from_secs(300));

    let orphan = OrphanConfig::default();
    assert_eq!(orphan.check_interval, Duration::from_secs(3600));
    assert_eq!(orphan.grace_period, Duration::from_secs(300));
    assert!(orphan.dry_run);
}

// ============================================================================
// Volume handle contract
// ============================================================================

/// The scenario from a 5 GiB RWO volume: slot, size and NQN are all
/// derivable from the CSI name plus driver config.
#[test]
fn test_volume_handle_derivation() {
    let slot = ident::slot_for_volume_name("test-vol-1");
    assert!(slot.starts_with("pvc-"));
    assert_eq!(slot.len(), 40);

    let nqn = ident::derive_nqn(DEFAULT_NQN_PREFIX, &slot).unwrap();
    assert_eq!(nqn, format!("nqn.2000-02.com.mikrotik:{}", slot));

    let capacity: u64 = 5 * (1 << 30);
    assert_eq!(capacity, 5_368_709_120);
    assert!(capacity >= MIN_VOLUME_SIZE && capacity <= MAX_VOLUME_SIZE);
}

#[test]
fn test_size_bounds() {
    assert_eq!(MIN_VOLUME_SIZE, 1 << 30);
    assert_eq!(MAX_VOLUME_SIZE, 16 * (1u64 << 40));
}

// ============================================================================
// Mount option policy
// ============================================================================

#[test]
fn test_mount_option_allowlist() {
    let mounter = Mounter::default();

    let accepted = mounter
        .filter_mount_options(&["noatime".to_string(), "discard".to_string()])
        .unwrap();
    assert_eq!(accepted, vec!["noatime", "discard"]);

    for forbidden in ["suid", "dev", "exec"] {
        assert!(
            mounter.filter_mount_options(&[forbidden.to_string()]).is_err(),
            "'{}' must be rejected",
            forbidden
        );
    }

    // Unknown options fail loudly instead of being dropped.
    assert!(mounter.filter_mount_options(&["remount".to_string()]).is_err());
}

// ============================================================================
// NVMe device naming
// ============================================================================

/// Namespace devices are used; controller-scoped paths are shadowed under
/// NVMe-over-fabrics multipath and must never be returned.
#[test]
fn test_namespace_device_policy() {
    assert!(is_namespace_device("nvme0n1"));
    assert!(is_namespace_device("nvme3n12"));
    assert!(!is_namespace_device("nvme0"));
    assert!(!is_namespace_device("nvme0c2n1"));
    assert!(!is_namespace_device("nvme0n1p2"));
    assert!(!is_namespace_device("sda"));
}

// ============================================================================
// Validation latency
// ============================================================================

/// Pathological inputs must be rejected quickly, never churned through the
/// matchers.
#[test]
fn test_pathological_inputs_return_quickly() {
    let start = std::time::Instant::now();

    let long_name = "a".repeat(10_000);
    // Slot derivation hashes; validation rejects by shape.
    assert!(ident::validate_slot(&long_name).is_err());
    assert!(ident::validate_snapshot_slot(&long_name).is_err());
    assert!(ident::validate_nqn(&long_name).is_err());

    assert!(start.elapsed() < Duration::from_millis(200));
}

// ============================================================================
// Snapshot identifier contract
// ============================================================================

#[test]
fn test_snapshot_id_independent_of_source() {
    // The snapshot UUID comes from the CSI snapshot name, not the source
    // volume, so the same name always maps to the same stem.
    let stem_a = ident::snapshot_slot_stem("nightly");
    let stem_b = ident::snapshot_slot_stem("nightly");
    assert_eq!(stem_a, stem_b);

    let slot = ident::snapshot_slot_for_name("nightly", 1_700_000_000);
    assert!(slot.starts_with(&stem_a));
    assert!(slot.ends_with("-at-1700000000"));
}
