//! Typed payloads for the Scaleway Block Storage and Instance APIs.
//!
//! Only the fields the driver actually consumes are modelled. Unknown
//! enum values deserialize to the `Unknown` variant so that new API states
//! do not break the wait loops.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An availability zone of the Scaleway platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Zone {
    #[serde(rename = "fr-par-1")]
    FrPar1,
    #[serde(rename = "fr-par-2")]
    FrPar2,
    #[serde(rename = "fr-par-3")]
    FrPar3,
    #[serde(rename = "nl-ams-1")]
    NlAms1,
    #[serde(rename = "nl-ams-2")]
    NlAms2,
    #[serde(rename = "nl-ams-3")]
    NlAms3,
    #[serde(rename = "pl-waw-1")]
    PlWaw1,
    #[serde(rename = "pl-waw-2")]
    PlWaw2,
    #[serde(rename = "pl-waw-3")]
    PlWaw3,
}

/// Error returned when parsing an unknown zone or region string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} {value:?}")]
pub struct ParseLocalityError {
    kind: &'static str,
    value: String,
}

impl Zone {
    /// The region this zone belongs to.
    pub fn region(self) -> Region {
        match self {
            Self::FrPar1 | Self::FrPar2 | Self::FrPar3 => Region::FrPar,
            Self::NlAms1 | Self::NlAms2 | Self::NlAms3 => Region::NlAms,
            Self::PlWaw1 | Self::PlWaw2 | Self::PlWaw3 => Region::PlWaw,
        }
    }

    /// String form as used in API paths, e.g. `fr-par-1`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrPar1 => "fr-par-1",
            Self::FrPar2 => "fr-par-2",
            Self::FrPar3 => "fr-par-3",
            Self::NlAms1 => "nl-ams-1",
            Self::NlAms2 => "nl-ams-2",
            Self::NlAms3 => "nl-ams-3",
            Self::PlWaw1 => "pl-waw-1",
            Self::PlWaw2 => "pl-waw-2",
            Self::PlWaw3 => "pl-waw-3",
        }
    }
}

impl fmt::Display for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Zone {
    type Err = ParseLocalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fr-par-1" => Ok(Self::FrPar1),
            "fr-par-2" => Ok(Self::FrPar2),
            "fr-par-3" => Ok(Self::FrPar3),
            "nl-ams-1" => Ok(Self::NlAms1),
            "nl-ams-2" => Ok(Self::NlAms2),
            "nl-ams-3" => Ok(Self::NlAms3),
            "pl-waw-1" => Ok(Self::PlWaw1),
            "pl-waw-2" => Ok(Self::PlWaw2),
            "pl-waw-3" => Ok(Self::PlWaw3),
            other => Err(ParseLocalityError {
                kind: "zone",
                value: other.to_owned(),
            }),
        }
    }
}

/// A region of the Scaleway platform, grouping several zones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Region {
    #[serde(rename = "fr-par")]
    FrPar,
    #[serde(rename = "nl-ams")]
    NlAms,
    #[serde(rename = "pl-waw")]
    PlWaw,
}

impl Region {
    /// Zones of this region.
    pub fn zones(self) -> Vec<Zone> {
        match self {
            Self::FrPar => vec![Zone::FrPar1, Zone::FrPar2, Zone::FrPar3],
            Self::NlAms => vec![Zone::NlAms1, Zone::NlAms2, Zone::NlAms3],
            Self::PlWaw => vec![Zone::PlWaw1, Zone::PlWaw2, Zone::PlWaw3],
        }
    }

    /// String form as used in API paths, e.g. `fr-par`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FrPar => "fr-par",
            Self::NlAms => "nl-ams",
            Self::PlWaw => "pl-waw",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = ParseLocalityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fr-par" => Ok(Self::FrPar),
            "nl-ams" => Ok(Self::NlAms),
            "pl-waw" => Ok(Self::PlWaw),
            other => Err(ParseLocalityError {
                kind: "region",
                value: other.to_owned(),
            }),
        }
    }
}

/// Status of a Block Storage volume.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeStatus {
    Creating,
    Available,
    InUse,
    Resizing,
    Snapshotting,
    Updating,
    Error,
    Deleting,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl VolumeStatus {
    /// Whether the status is terminal from the point of view of a wait loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Available | Self::InUse | Self::Error | Self::Deleted
        )
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Resizing => "resizing",
            Self::Snapshotting => "snapshotting",
            Self::Updating => "updating",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Status of a reference between a volume and another product resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceStatus {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Error,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ReferenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Attaching => "attaching",
            Self::Attached => "attached",
            Self::Detaching => "detaching",
            Self::Detached => "detached",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A link between a volume and a resource consuming it (e.g. a server).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reference {
    pub id: String,
    pub product_resource_type: String,
    pub product_resource_id: String,
    pub status: ReferenceStatus,
}

/// Performance characteristics of a volume.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VolumeSpecifications {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perf_iops: Option<u32>,
    #[serde(default)]
    pub class: String,
}

/// A Block Storage volume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    /// Size in bytes.
    pub size: u64,
    pub status: VolumeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<String>,
    #[serde(default)]
    pub references: Vec<Reference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specs: Option<VolumeSpecifications>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Status of a Block Storage snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    Snapshotting,
    Available,
    InUse,
    Error,
    Deleting,
    Deleted,
    #[serde(other)]
    Unknown,
}

impl SnapshotStatus {
    /// Whether the status is terminal from the point of view of a wait loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Available | Self::InUse | Self::Error | Self::Deleted
        )
    }
}

impl fmt::Display for SnapshotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Snapshotting => "snapshotting",
            Self::Available => "available",
            Self::InUse => "in_use",
            Self::Error => "error",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// The volume a snapshot was cut from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotParentVolume {
    pub id: String,
    pub name: String,
}

/// A Block Storage snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub zone: Zone,
    /// Size in bytes.
    pub size: u64,
    pub status: SnapshotStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_volume: Option<SnapshotParentVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A volume as seen from an Instance server's volume map.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerVolume {
    pub id: String,
    #[serde(default)]
    pub volume_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot: Option<bool>,
}

/// An Instance server. Only the fields relevant to volume attachment are kept.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub zone: Zone,
    /// Attached volumes keyed by slot ("0" is the root volume).
    #[serde(default)]
    pub volumes: HashMap<String, ServerVolume>,
}

// Request and response bodies.

#[derive(Clone, Debug, Serialize)]
pub struct CreateVolumeFromEmpty {
    pub size: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreateVolumeFromSnapshot {
    pub snapshot_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreateVolumeBody {
    pub name: String,
    pub project_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perf_iops: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_empty: Option<CreateVolumeFromEmpty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_snapshot: Option<CreateVolumeFromSnapshot>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UpdateVolumeBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct CreateSnapshotBody {
    pub name: String,
    pub volume_id: String,
    pub project_id: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListVolumesResponse {
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ListSnapshotsResponse {
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    #[serde(default)]
    pub total_count: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GetServerResponse {
    pub server: Server,
}

/// Volume entry in a server PATCH body. `volume_type` must be set for Block
/// Storage volumes, otherwise the Instance API rejects the attachment.
#[derive(Clone, Debug, Serialize)]
pub struct ServerVolumeTemplate {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<bool>,
}

#[derive(Clone, Debug, Serialize)]
pub struct UpdateServerVolumesBody {
    pub volumes: HashMap<String, ServerVolumeTemplate>,
}
