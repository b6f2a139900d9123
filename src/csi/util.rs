//! Shared helpers of the CSI services: zonal IDs, capacity resolution,
//! topology selection, capability validation, parameter parsing, the
//! per-volume lock table and error-code mapping.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use super::proto::{
    AccessMode, AccessType, CapacityRange, Code, Snapshot, Status, Topology, TopologyRequirement,
    Volume, VolumeCapability, VolumeContentSource,
};
use crate::scaleway::{
    self, Metadata, SnapshotStatus, Zone, INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE,
    LEGACY_DEFAULT_VOLUME_TYPE, LEGACY_DEFAULT_VOLUME_TYPE_IOPS, MAX_VOLUMES_PER_NODE,
    MIN_VOLUME_SIZE,
};

/// The official name of the CSI plugin.
pub const DRIVER_NAME: &str = "csi.scaleway.com";

/// The version of the CSI plugin, stamped at build time.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Topology key used to provision volumes.
pub const ZONE_TOPOLOGY_KEY: &str = "topology.csi.scaleway.com/zone";

/// Environment variable appended to the client user agent.
pub const EXTRA_USER_AGENT_ENV: &str = "EXTRA_USER_AGENT";

/// Key of the volume ID in the publish context.
pub const PUBLISH_CONTEXT_VOLUME_ID_KEY: &str = "csi.scaleway.com/volume-id";
/// Key of the volume name in the publish context.
pub const PUBLISH_CONTEXT_VOLUME_NAME_KEY: &str = "csi.scaleway.com/volume-name";
/// Key of the volume zone in the publish context.
pub const PUBLISH_CONTEXT_VOLUME_ZONE_KEY: &str = "csi.scaleway.com/volume-zone";

/// Key of the volume type parameter.
pub const VOLUME_TYPE_PARAMETER_KEY: &str = "type";
/// Key of the encrypted parameter.
pub const ENCRYPTED_PARAMETER_KEY: &str = "encrypted";
/// Key of the iops parameter.
pub const VOLUME_IOPS_PARAMETER_KEY: &str = "iops";

/// Name of the secret holding the LUKS passphrase.
pub const ENCRYPTION_PASSPHRASE_KEY: &str = "encryptionPassphrase";

/// Access modes supported for Scaleway Block volumes.
pub const SUPPORTED_ACCESS_MODES: [AccessMode; 4] = [
    AccessMode::SingleNodeWriter,
    AccessMode::SingleNodeReaderOnly,
    AccessMode::SingleNodeSingleWriter,
    AccessMode::SingleNodeMultiWriter,
];

/// The client user agent, with `EXTRA_USER_AGENT` appended when set.
pub fn user_agent() -> String {
    let mut user_agent = format!("{DRIVER_NAME} {DRIVER_VERSION}");
    if let Ok(extra) = env::var(EXTRA_USER_AGENT_ENV) {
        if !extra.is_empty() {
            user_agent.push(' ');
            user_agent.push_str(&extra);
        }
    }
    user_agent
}

/// Concatenates the zone and ID of a resource to create a zonal ID.
pub fn expand_zonal_id(id: &str, zone: Zone) -> String {
    format!("{zone}/{id}")
}

/// Takes a zonal ID and returns the ID and zone of the resource. Legacy IDs
/// without a zone component yield `None`, as does an unrecognized zone (with
/// a warning); the caller falls back to the client default.
pub fn extract_id_and_zone(id: &str) -> Result<(String, Option<Zone>), Status> {
    if id.is_empty() {
        return Err(Status::invalid_argument("ID must not be empty"));
    }

    let parts: Vec<&str> = id.split('/').collect();
    match parts.as_slice() {
        [bare] => Ok(((*bare).to_owned(), None)),
        [zone_part, resource_id] => match zone_part.parse::<Zone>() {
            Ok(zone) => Ok(((*resource_id).to_owned(), Some(zone))),
            Err(_) => {
                warn!("wrong zone in ID {id:?}, will try default zone");
                Ok(((*resource_id).to_owned(), None))
            }
        },
        _ => Err(Status::invalid_argument(format!(
            "ID {id:?} is not correctly formatted"
        ))),
    }
}

/// Returns the most appropriate zones according to the accessibility
/// requirements and the zone of the content-source snapshot, preferred zones
/// first.
pub fn choose_zones(
    accessibility_requirements: Option<&TopologyRequirement>,
    snapshot_zone: Option<Zone>,
) -> Result<Vec<Zone>, Status> {
    let Some(requirements) = accessibility_requirements else {
        return Ok(snapshot_zone.map_or_else(Vec::new, |zone| vec![zone]));
    };

    let mut requisite_zones: Vec<Zone> = Vec::new();
    for requisite in &requirements.requisite {
        for (key, value) in &requisite.segments {
            if key != ZONE_TOPOLOGY_KEY {
                warn!("unknown topology key {key} for requisite");
                continue;
            }
            let Ok(zone) = value.parse::<Zone>() else {
                warn!(
                    "the given value for requisite {ZONE_TOPOLOGY_KEY}: {value} is not a valid zone"
                );
                continue;
            };
            if snapshot_zone.is_none_or(|snap| snap == zone) && !requisite_zones.contains(&zone) {
                requisite_zones.push(zone);
            }
        }
    }

    let mut preferred_zones: Vec<Zone> = Vec::new();
    for preferred in &requirements.preferred {
        for (key, value) in &preferred.segments {
            if key != ZONE_TOPOLOGY_KEY {
                warn!("unknown topology key {key} for preferred");
                continue;
            }
            let Ok(zone) = value.parse::<Zone>() else {
                warn!(
                    "the given value for preferred {ZONE_TOPOLOGY_KEY}: {value} is not a valid zone"
                );
                continue;
            };
            if snapshot_zone.is_none_or(|snap| snap == zone) && !preferred_zones.contains(&zone) {
                if !requirements.requisite.is_empty() {
                    if !requisite_zones.contains(&zone) {
                        return Err(Status::invalid_argument(format!(
                            "{key}: {value} is specified in preferred but not in requisite"
                        )));
                    }
                    requisite_zones.retain(|z| *z != zone);
                }
                preferred_zones.push(zone);
            }
        }
    }

    preferred_zones.extend(requisite_zones);

    if snapshot_zone.is_some() && preferred_zones.len() != 1 {
        return Err(Status::resource_exhausted(
            "desired volume content source and desired topology are not compatible, different zones",
        ));
    }

    Ok(preferred_zones)
}

/// Validates a single volume capability. Returns `(block, mount)`.
pub fn validate_volume_capability(capability: &VolumeCapability) -> Result<(bool, bool), Status> {
    match capability.access_mode {
        Some(mode) if SUPPORTED_ACCESS_MODES.contains(&mode) => {}
        Some(mode) => {
            return Err(Status::invalid_argument(format!(
                "mode {mode:?} not supported"
            )))
        }
        None => return Err(Status::invalid_argument("access mode not specified")),
    }

    match capability.access_type {
        Some(AccessType::Block) => Ok((true, false)),
        Some(AccessType::Mount(_)) => Ok((false, true)),
        None => Err(Status::invalid_argument(
            "one of block or mount access type is not specified",
        )),
    }
}

/// Makes sure the provided volume capabilities are valid and supported by the
/// driver. If `optional` is false, at least one capability is required.
pub fn validate_volume_capabilities(
    capabilities: &[VolumeCapability],
    optional: bool,
) -> Result<(), Status> {
    if !optional && capabilities.is_empty() {
        return Err(Status::invalid_argument(
            "no volumeCapabilities were provided",
        ));
    }

    for (i, capability) in capabilities.iter().enumerate() {
        if let Err(err) = validate_volume_capability(capability) {
            return Err(Status::invalid_argument(format!(
                "unsupported volume capability at index {i}: {}",
                err.message()
            )));
        }
    }

    Ok(())
}

/// Returns the volume capacity that will be requested to the Block Storage
/// API according to the provided capacity range.
pub fn volume_request_capacity(capacity_range: Option<&CapacityRange>) -> Result<u64, Status> {
    const MIN: i64 = MIN_VOLUME_SIZE as i64;

    let Some(range) = capacity_range else {
        return Ok(MIN_VOLUME_SIZE);
    };

    let required = range.required_bytes;
    let required_set = required > 0;
    let limit = range.limit_bytes;
    let limit_set = limit > 0;

    if !required_set && !limit_set {
        return Ok(MIN_VOLUME_SIZE);
    }

    if required_set && limit_set && limit < required {
        return Err(Status::out_of_range("limit size is less than required size"));
    }

    if required_set && !limit_set && required < MIN {
        return Err(Status::out_of_range(
            "required size is less than the minimum size",
        ));
    }

    if limit_set && limit < MIN {
        return Err(Status::out_of_range(
            "limit size is less than the minimum size",
        ));
    }

    if required_set && limit_set && required == limit {
        return Ok(required as u64);
    }

    if required_set {
        return Ok(required as u64);
    }

    if limit_set {
        return Ok(limit as u64);
    }

    Ok(MIN_VOLUME_SIZE)
}

/// Parses the parameters sent by the CO during volume creation. Returns the
/// requested number of IOPS, if any, and whether the volume is encrypted.
pub fn parse_create_volume_params(
    params: &HashMap<String, String>,
) -> Result<(Option<u32>, bool), Status> {
    let mut encrypted = false;
    let mut perf_iops: Option<u32> = None;
    let mut volume_type: Option<String> = None;

    for (key, value) in params {
        match key.to_lowercase().as_str() {
            VOLUME_TYPE_PARAMETER_KEY => {
                if value != LEGACY_DEFAULT_VOLUME_TYPE {
                    return Err(Status::invalid_argument(format!(
                        "invalid value ({value}) for parameter {key}: unknown volume type"
                    )));
                }
                volume_type = Some(value.clone());
            }
            ENCRYPTED_PARAMETER_KEY => {
                encrypted = value.parse::<bool>().map_err(|err| {
                    Status::invalid_argument(format!(
                        "invalid bool value ({value}) for parameter {key}: {err}"
                    ))
                })?;
            }
            VOLUME_IOPS_PARAMETER_KEY => {
                let iops = value.parse::<u32>().map_err(|err| {
                    Status::invalid_argument(format!(
                        "invalid value ({value}) for parameter {key}: {err}"
                    ))
                })?;
                perf_iops = Some(iops);
            }
            _ => {
                return Err(Status::invalid_argument(format!(
                    "invalid parameter key {key}"
                )))
            }
        }
    }

    // The legacy volume type only exists with its fixed number of IOPS.
    if volume_type.is_some() && perf_iops.is_some_and(|iops| iops != LEGACY_DEFAULT_VOLUME_TYPE_IOPS)
    {
        return Err(Status::invalid_argument(format!(
            "volume type {LEGACY_DEFAULT_VOLUME_TYPE} only supports {LEGACY_DEFAULT_VOLUME_TYPE_IOPS} iops"
        )));
    }

    Ok((perf_iops, encrypted))
}

/// Parses a numeric starting token. An empty token means start from zero.
pub fn parse_starting_token(token: &str) -> Result<u32, Status> {
    if token.is_empty() {
        return Ok(0);
    }

    token.parse::<u32>().map_err(|err| {
        Status::aborted(format!(
            "invalid startingToken: failed to parse token into a number: {err}"
        ))
    })
}

/// Converts a size in bytes to the CSI `i64` representation.
pub fn size_to_i64(size: u64) -> i64 {
    // Sizes beyond i64::MAX cannot occur on the Block API.
    i64::try_from(size).unwrap_or(i64::MAX)
}

/// Builds the CSI volume from a Block Storage volume.
pub fn csi_volume(volume: &scaleway::Volume) -> Volume {
    let content_source =
        volume
            .parent_snapshot_id
            .as_ref()
            .map(|snapshot_id| VolumeContentSource::Snapshot {
                snapshot_id: expand_zonal_id(snapshot_id, volume.zone),
            });

    Volume {
        volume_id: expand_zonal_id(&volume.id, volume.zone),
        capacity_bytes: size_to_i64(volume.size),
        volume_context: HashMap::new(),
        content_source,
        accessible_topology: vec![Topology {
            segments: HashMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), volume.zone.to_string())]),
        }],
    }
}

/// Builds the CSI snapshot from a Block Storage snapshot.
pub fn csi_snapshot(snapshot: &scaleway::Snapshot) -> Snapshot {
    Snapshot {
        snapshot_id: expand_zonal_id(&snapshot.id, snapshot.zone),
        source_volume_id: snapshot
            .parent_volume
            .as_ref()
            .map(|parent| expand_zonal_id(&parent.id, snapshot.zone))
            .unwrap_or_default(),
        size_bytes: size_to_i64(snapshot.size),
        creation_time: snapshot.created_at,
        ready_to_use: matches!(
            snapshot.status,
            SnapshotStatus::Available | SnapshotStatus::InUse
        ),
    }
}

/// Returns the zonal ID of the node the volume is attached to. There is
/// either one or zero entry, a volume has at most one server reference.
pub fn published_node_ids(volume: &scaleway::Volume) -> Vec<String> {
    volume
        .references
        .iter()
        .find(|r| r.product_resource_type == INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE)
        .map(|r| vec![expand_zonal_id(&r.product_resource_id, volume.zone)])
        .unwrap_or_default()
}

/// Reads the `encrypted` flag from a volume context.
pub fn is_volume_encrypted(volume_context: &HashMap<String, String>) -> Result<bool, Status> {
    match volume_context.get(ENCRYPTED_PARAMETER_KEY) {
        None => Ok(false),
        Some(value) => value.parse::<bool>().map_err(|err| {
            Status::invalid_argument(format!(
                "failed to check if volume is encrypted from volume context: {err}"
            ))
        }),
    }
}

/// Returns the most appropriate RPC code for a Scaleway client error.
pub fn code_from_scaleway_error(err: &scaleway::Error) -> Code {
    match err {
        scaleway::Error::VolumeDifferentSize { .. } | scaleway::Error::SnapshotExists => {
            Code::AlreadyExists
        }
        err if err.is_not_found() => Code::NotFound,
        err if err.is_precondition_failed() => Code::FailedPrecondition,
        _ => Code::Internal,
    }
}

/// Builds an RPC status from a Scaleway client error, prefixed with context.
pub fn status_from_scaleway_error(context: &str, err: &scaleway::Error) -> Status {
    Status::new(code_from_scaleway_error(err), format!("{context}: {err}"))
}

/// The number of attached scratch volumes, based on the instance metadata.
pub fn attached_scratch_volumes(metadata: &Metadata) -> usize {
    metadata
        .volumes
        .values()
        .filter(|v| v.volume_type == "scratch")
        .count()
}

/// The maximum number of volumes that can be attached to a node, after
/// subtracting the root volume and the reserved count.
pub fn max_volumes_per_node(reserved_count: usize) -> Result<i64, Status> {
    let max = MAX_VOLUMES_PER_NODE as i64 - reserved_count as i64 - 1;
    if max <= 0 {
        return Err(Status::internal(format!(
            "max number of volumes that can be attached to this node must be at least 1, currently is {max}"
        )));
    }
    Ok(max)
}

#[derive(Default)]
struct LockEntry {
    mutex: Arc<tokio::sync::Mutex<()>>,
    waiters: usize,
}

/// Process-wide keyed mutex serializing operations per volume. Operations on
/// different volumes proceed in parallel; there is no global lock.
#[derive(Default)]
pub struct VolumeLocks {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl VolumeLocks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquires the lock for the given volume ID. The lock is held until the
    /// returned guard is dropped.
    pub async fn lock(self: &Arc<Self>, volume_id: &str) -> VolumeLockGuard {
        let mutex = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(volume_id.to_owned()).or_default();
            entry.waiters += 1;
            Arc::clone(&entry.mutex)
        };

        let guard = mutex.lock_owned().await;

        VolumeLockGuard {
            locks: Arc::clone(self),
            volume_id: volume_id.to_owned(),
            guard: Some(guard),
        }
    }
}

/// Guard of a per-volume lock. Dropping it releases the lock and garbage
/// collects the entry once no task is interested in the volume anymore.
pub struct VolumeLockGuard {
    locks: Arc<VolumeLocks>,
    volume_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VolumeLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut entries = self.locks.entries.lock();
        if let Some(entry) = entries.get_mut(&self.volume_id) {
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entries.remove(&self.volume_id);
            }
        }
    }
}
