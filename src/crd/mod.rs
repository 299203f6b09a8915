//! StorageVolume CRD
//!
//! The desired-state entity for a node-local disk partition. The object is
//! created and mutated by external API clients; this operator only reads the
//! spec and writes the status.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// StorageVolume CRD
// =============================================================================

/// StorageVolume requests a partition of a given capacity on a specific
/// device of a specific node. Existence of the object (and its deletion
/// marker) is the sole source of truth for desired presence.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "scp.storage.io",
    version = "v1alpha1",
    kind = "StorageVolume",
    plural = "storagevolumes",
    shortname = "sv",
    status = "StorageVolumeStatus",
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.ownNodeId"}"#,
    printcolumn = r#"{"name": "Capacity", "type": "string", "jsonPath": ".spec.capacity"}"#,
    printcolumn = r#"{"name": "Device", "type": "string", "jsonPath": ".spec.devicePath"}"#,
    printcolumn = r#"{"name": "Phase", "type": "string", "jsonPath": ".status.phase"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolumeSpec {
    /// Node that owns the backing device. Volumes targeting other nodes are
    /// ignored by this controller instance.
    pub own_node_id: String,

    /// Requested capacity as a quantity string (e.g. "10Gi")
    pub capacity: String,

    /// Target block device (e.g. /dev/sdb)
    pub device_path: String,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a StorageVolume
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVolumeStatus {
    /// Current lifecycle phase
    #[serde(default)]
    pub phase: VolumePhase,

    /// Human-readable detail for the current phase (set on failure)
    #[serde(default)]
    pub message: Option<String>,

    /// Last phase transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

/// Volume lifecycle phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum VolumePhase {
    #[default]
    Pending,
    Provisioning,
    Bound,
    Releasing,
    Released,
    Failed,
}

impl std::fmt::Display for VolumePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumePhase::Pending => write!(f, "Pending"),
            VolumePhase::Provisioning => write!(f, "Provisioning"),
            VolumePhase::Bound => write!(f, "Bound"),
            VolumePhase::Releasing => write!(f, "Releasing"),
            VolumePhase::Released => write!(f, "Released"),
            VolumePhase::Failed => write!(f, "Failed"),
        }
    }
}

// =============================================================================
// Capacity Parsing
// =============================================================================

/// Parse a capacity quantity string into bytes.
///
/// Accepts binary suffixes (Ki, Mi, Gi, Ti, Pi), decimal suffixes
/// (K, M, G, T, P) and plain byte counts.
pub fn parse_capacity(input: &str) -> Result<u64> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity".into()));
    }

    let digits_end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);

    let value: u64 = num
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number in {:?}", input)))?;

    let multiplier: u64 = match suffix {
        "" => 1,
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "K" | "k" => 1_000,
        "M" => 1_000_000,
        "G" => 1_000_000_000,
        "T" => 1_000_000_000_000,
        "P" => 1_000_000_000_000_000,
        other => {
            return Err(Error::CapacityParse(format!(
                "unknown suffix {:?} in {:?}",
                other, input
            )))
        }
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::CapacityParse(format!("capacity overflow in {:?}", input)))
}

// =============================================================================
// Implementations
// =============================================================================

impl StorageVolume {
    /// Stable resource key used throughout the controller: "namespace/name"
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or("unknown")
        )
    }

    /// Get the name of this volume
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unknown")
    }

    /// Requested capacity in bytes
    pub fn capacity_bytes(&self) -> Result<u64> {
        parse_capacity(&self.spec.capacity)
    }

    /// Current phase, defaulting to Pending when no status has been written
    pub fn phase(&self) -> VolumePhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }

    /// Whether the object carries a deletion marker
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ObjectMeta;

    fn volume(ns: &str, name: &str) -> StorageVolume {
        StorageVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                ..Default::default()
            },
            spec: StorageVolumeSpec {
                own_node_id: "node-1".into(),
                capacity: "10Gi".into(),
                device_path: "/dev/sdb".into(),
            },
            status: None,
        }
    }

    #[test]
    fn test_key() {
        assert_eq!(volume("scp", "v1").key(), "scp/v1");
    }

    #[test]
    fn test_parse_capacity() {
        assert_eq!(parse_capacity("1024").unwrap(), 1024);
        assert_eq!(parse_capacity("1Ki").unwrap(), 1024);
        assert_eq!(parse_capacity("10Gi").unwrap(), 10 * (1u64 << 30));
        assert_eq!(parse_capacity("2Ti").unwrap(), 2 * (1u64 << 40));
        assert_eq!(parse_capacity("5G").unwrap(), 5_000_000_000);
    }

    #[test]
    fn test_parse_capacity_rejects_garbage() {
        assert!(parse_capacity("").is_err());
        assert!(parse_capacity("Gi").is_err());
        assert!(parse_capacity("10Qi").is_err());
        assert!(parse_capacity("-5Gi").is_err());
    }

    #[test]
    fn test_phase_defaults_to_pending() {
        assert_eq!(volume("scp", "v1").phase(), VolumePhase::Pending);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(format!("{}", VolumePhase::Bound), "Bound");
        assert_eq!(format!("{}", VolumePhase::Failed), "Failed");
    }
}
