//! Core data model: volumes, capabilities and lifecycle requests.
//!
//! The request types mirror the shape of the platform's lifecycle calls after
//! the protocol layer has decoded them. They are [`Serialize`]/[`Deserialize`]
//! so a transport can carry them as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::params::ResolvedParameters;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// A provisioned volume: a path inside a named remote.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Opaque, cluster-unique identifier.
    pub id: String,
    /// Backend profile name.
    pub remote: String,
    /// Backend-relative root of the volume.
    pub remote_path: String,
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.id, self.remote, self.remote_path)
    }
}

/// A volume together with the full parameter set it was resolved from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedVolume {
    pub volume: Volume,
    pub parameters: ResolvedParameters,
}

impl ResolvedVolume {
    pub fn new(id: impl Into<String>, parameters: ResolvedParameters) -> Self {
        Self {
            volume: Volume {
                id: id.into(),
                remote: parameters.remote.clone(),
                remote_path: parameters.remote_path.clone(),
            },
            parameters,
        }
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    /// Additional mount flags (e.g. `"noatime"`).
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::ReadWriteMany,
            mount_flags: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller requests
// ---------------------------------------------------------------------------

/// Request to provision a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Name chosen by the platform; becomes the volume id.
    pub name: String,
    /// Requested capacity; remembered, never enforced.
    #[serde(default)]
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters plus platform-injected claim references.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Cluster-wide connection defaults.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Descriptor returned from provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProvisionedVolume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub remote: String,
    pub remote_path: String,
    /// Attributes handed back on every node call for this volume.
    pub volume_context: HashMap<String, String>,
}

/// Request to deprovision a volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to confirm a volume supports the given capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Capabilities echoed back when the volume is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmedCapabilities {
    pub volume_capabilities: Vec<VolumeCapability>,
    pub volume_context: HashMap<String, String>,
    pub parameters: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Node requests
// ---------------------------------------------------------------------------

/// Request to mount a volume at a target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub read_only: bool,
    /// Attributes from provisioning (`secretName`, `namespace`, ...).
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Cluster-wide connection defaults.
    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

/// Request to unmount a volume from a target path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

// ---------------------------------------------------------------------------
// Plugin info
// ---------------------------------------------------------------------------

/// Information about the plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub vendor_version: String,
}

/// Optional services the plugin provides.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_display() {
        let vol = Volume {
            id: "pvc-1".into(),
            remote: "my-s3".into(),
            remote_path: "data".into(),
        };
        assert_eq!(vol.to_string(), "pvc-1 (my-s3:data)");
    }

    #[test]
    fn publish_request_from_json() {
        let json = r#"{
            "volume_id": "v1",
            "target_path": "/mnt/t",
            "volume_capability": {"access_mode": "ReadWriteMany"},
            "volume_context": {"secretName": "claim", "namespace": "ns"}
        }"#;
        let req: NodePublishVolumeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.volume_id, "v1");
        assert!(!req.read_only);
        assert_eq!(
            req.volume_capability.map(|c| c.access_mode),
            Some(AccessMode::ReadWriteMany)
        );
        assert!(req.secrets.is_empty());
    }
}
