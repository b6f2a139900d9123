//! CSI contract types.
//!
//! The gRPC wire surface is a mechanical translation of these contracts and
//! lives outside this crate; services exchange these plain types over the
//! envelope defined in [`crate::csi::server`]. Field names and semantics
//! follow the CSI specification.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Canonical RPC error codes used at the service boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    OutOfRange,
    Aborted,
    Unimplemented,
    Unavailable,
    Unknown,
    Internal,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidArgument => "InvalidArgument",
            Self::NotFound => "NotFound",
            Self::AlreadyExists => "AlreadyExists",
            Self::FailedPrecondition => "FailedPrecondition",
            Self::ResourceExhausted => "ResourceExhausted",
            Self::OutOfRange => "OutOfRange",
            Self::Aborted => "Aborted",
            Self::Unimplemented => "Unimplemented",
            Self::Unavailable => "Unavailable",
            Self::Unknown => "Unknown",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// An RPC error: a code plus a human-readable message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    code: Code,
    message: String,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(Code::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(Code::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(Code::FailedPrecondition, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Self::new(Code::OutOfRange, message)
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(Code::Aborted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn code(&self) -> Code {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for Status {}

/// Map of secret values keyed by name. The `Debug` representation redacts
/// the values so that request logging can never leak a passphrase.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secrets(pub HashMap<String, String>);

impl Secrets {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&str> = self.0.keys().map(String::as_str).collect();
        keys.sort_unstable();
        write!(f, "[")?;
        for (i, key) in keys.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "{key}:<redacted>")?;
        }
        write!(f, "]")
    }
}

/// How a volume may be accessed by workloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    SingleNodeSingleWriter,
    SingleNodeMultiWriter,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
}

/// Mount-specific parameters of a volume capability.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountVolume {
    #[serde(default)]
    pub fs_type: String,
    #[serde(default)]
    pub mount_flags: Vec<String>,
}

/// Raw block or mounted filesystem access.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessType {
    Block,
    Mount(MountVolume),
}

/// A capability a volume must satisfy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_type: Option<AccessType>,
    pub access_mode: Option<AccessMode>,
}

impl VolumeCapability {
    /// Convenience constructor for a mount capability.
    pub fn mount(fs_type: &str, mount_flags: &[&str], mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Mount(MountVolume {
                fs_type: fs_type.to_owned(),
                mount_flags: mount_flags.iter().map(|s| (*s).to_owned()).collect(),
            })),
            access_mode: Some(mode),
        }
    }

    /// Convenience constructor for a block capability.
    pub fn block(mode: AccessMode) -> Self {
        Self {
            access_type: Some(AccessType::Block),
            access_mode: Some(mode),
        }
    }
}

/// Topology expressed as key/value segments.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Topology constraints for volume provisioning.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

/// Capacity constraints for volume provisioning. Zero means unset.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityRange {
    pub required_bytes: i64,
    pub limit_bytes: i64,
}

/// Source a volume is provisioned from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeContentSource {
    Snapshot { snapshot_id: String },
    Volume { volume_id: String },
}

/// A provisioned volume as reported to the CO.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: String,
    pub capacity_bytes: i64,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// A snapshot as reported to the CO.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    #[serde(default)]
    pub source_volume_id: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub creation_time: Option<DateTime<Utc>>,
    pub ready_to_use: bool,
}

// Identity service.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPluginInfoRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    pub name: String,
    pub vendor_version: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesRequest {}

/// Capabilities the plugin advertises at the identity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PluginCapability {
    ControllerService,
    VolumeAccessibilityConstraints,
    VolumeExpansionOnline,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<PluginCapability>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProbeRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}

// Controller service.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_content_source: Option<VolumeContentSource>,
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerPublishVolumeResponse {
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: String,
    pub node_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesRequest {
    pub volume_id: String,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesConfirmed {
    pub volume_capabilities: Vec<VolumeCapability>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    #[serde(default)]
    pub confirmed: Option<ValidateVolumeCapabilitiesConfirmed>,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListVolumesVolumeStatus {
    #[serde(default)]
    pub published_node_ids: Vec<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListVolumesEntry {
    pub volume: Volume,
    #[serde(default)]
    pub status: ListVolumesVolumeStatus,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    #[serde(default)]
    pub entries: Vec<ListVolumesEntry>,
    #[serde(default)]
    pub next_token: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerGetVolumeRequest {
    pub volume_id: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerGetVolumeResponse {
    pub volume: Volume,
    #[serde(default)]
    pub status: ListVolumesVolumeStatus,
}

/// Capabilities of the controller service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ListVolumes,
    CreateDeleteSnapshot,
    ListSnapshots,
    ExpandVolume,
    GetVolume,
    SingleNodeMultiWriter,
    ListVolumesPublishedNodes,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<ControllerCapability>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub name: String,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotRequest {
    pub snapshot_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeleteSnapshotResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListSnapshotsRequest {
    #[serde(default)]
    pub max_entries: i32,
    #[serde(default)]
    pub starting_token: String,
    #[serde(default)]
    pub source_volume_id: String,
    #[serde(default)]
    pub snapshot_id: String,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListSnapshotsEntry {
    pub snapshot: Snapshot,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListSnapshotsResponse {
    #[serde(default)]
    pub entries: Vec<ListSnapshotsEntry>,
    #[serde(default)]
    pub next_token: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: i64,
    pub node_expansion_required: bool,
}

// Node service.

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeStageVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeRequest {
    pub volume_id: String,
    pub staging_target_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUnstageVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    #[serde(default)]
    pub staging_target_path: String,
    pub target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodePublishVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeUnpublishVolumeResponse {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsRequest {
    pub volume_id: String,
    pub volume_path: String,
    #[serde(default)]
    pub staging_target_path: String,
}

/// Unit of a reported usage figure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: i64,
    pub available: i64,
    pub used: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetVolumeStatsResponse {
    #[serde(default)]
    pub usage: Vec<VolumeUsage>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: String,
    pub volume_path: String,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub staging_target_path: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub secrets: Secrets,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: i64,
}

/// Capabilities of the node service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeCapability {
    StageUnstageVolume,
    GetVolumeStats,
    ExpandVolume,
    SingleNodeMultiWriter,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<NodeCapability>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetInfoRequest {}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    pub node_id: String,
    pub max_volumes_per_node: i64,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_debug_is_redacted() {
        let mut map = HashMap::new();
        map.insert("encryptionPassphrase".to_owned(), "hunter2".to_owned());
        map.insert("other".to_owned(), "value".to_owned());
        let secrets = Secrets(map);

        let printed = format!("{secrets:?}");
        assert_eq!(printed, "[encryptionPassphrase:<redacted> other:<redacted>]");
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn request_debug_never_contains_secret_values() {
        let req = NodeStageVolumeRequest {
            volume_id: "fr-par-1/11111111-1111-1111-1111-111111111111".to_owned(),
            staging_target_path: "/staging".to_owned(),
            secrets: Secrets(HashMap::from([(
                "encryptionPassphrase".to_owned(),
                "top-secret".to_owned(),
            )])),
            ..Default::default()
        };
        let printed = format!("{req:?}");
        assert!(printed.contains("encryptionPassphrase:<redacted>"));
        assert!(!printed.contains("top-secret"));
        assert!(printed.contains("/staging"));
    }

    #[test]
    fn status_displays_code_and_message() {
        let status = Status::failed_precondition("volume is attached");
        assert_eq!(status.code(), Code::FailedPrecondition);
        assert_eq!(status.to_string(), "FailedPrecondition: volume is attached");
    }

    #[test]
    fn envelope_round_trip() {
        let req = CreateVolumeRequest {
            name: "pvc-1".to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 10_000_000_000,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount(
                "ext4",
                &["noatime"],
                AccessMode::SingleNodeWriter,
            )],
            ..Default::default()
        };
        let json = serde_json::to_string(&req).expect("serialize");
        let back: CreateVolumeRequest = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.name, "pvc-1");
        assert_eq!(back.volume_capabilities.len(), 1);
    }
}
