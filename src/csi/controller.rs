//! The CSI controller service: cluster-wide lifecycle of volumes and
//! snapshots against the Block Storage API.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use super::proto::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerGetVolumeRequest, ControllerGetVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse,
    CreateVolumeRequest, CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse,
    DeleteVolumeRequest, DeleteVolumeResponse, ListSnapshotsEntry, ListSnapshotsRequest,
    ListSnapshotsResponse, ListVolumesEntry, ListVolumesRequest, ListVolumesResponse,
    ListVolumesVolumeStatus, Status, ValidateVolumeCapabilitiesConfirmed,
    ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, VolumeContentSource,
};
use super::util::{
    choose_zones, csi_snapshot, csi_volume, expand_zonal_id,
    extract_id_and_zone, parse_create_volume_params, parse_starting_token, published_node_ids,
    size_to_i64, status_from_scaleway_error, user_agent, validate_volume_capabilities,
    validate_volume_capability, volume_request_capacity, VolumeLocks,
    ENCRYPTED_PARAMETER_KEY, PUBLISH_CONTEXT_VOLUME_ID_KEY, PUBLISH_CONTEXT_VOLUME_NAME_KEY,
    PUBLISH_CONTEXT_VOLUME_ZONE_KEY,
};
use crate::scaleway::{self, Api, Snapshot, SnapshotStatus, Volume, Zone, MAX_VOLUMES_PER_NODE};

/// Capabilities advertised by the controller service.
const CONTROLLER_CAPABILITIES: [ControllerCapability; 9] = [
    ControllerCapability::CreateDeleteVolume,
    ControllerCapability::PublishUnpublishVolume,
    ControllerCapability::ListVolumes,
    ControllerCapability::CreateDeleteSnapshot,
    ControllerCapability::ListSnapshots,
    ControllerCapability::ExpandVolume,
    ControllerCapability::GetVolume,
    ControllerCapability::SingleNodeMultiWriter,
    ControllerCapability::ListVolumesPublishedNodes,
];

/// The CSI controller service.
pub struct ControllerService {
    scaleway: Arc<dyn Api>,
    /// Prefix added to the name of newly created volumes.
    prefix: String,
    /// Serializes operations per volume, e.g. a detach racing a snapshot.
    locks: Arc<VolumeLocks>,
}

impl ControllerService {
    /// Builds the controller service over the production client.
    pub fn new(prefix: &str) -> anyhow::Result<Self> {
        let client = scaleway::Client::new(&user_agent())?;
        Ok(Self::with_client(Arc::new(client), prefix))
    }

    /// Builds the controller service over any client, used by tests.
    pub fn with_client(scaleway: Arc<dyn Api>, prefix: &str) -> Self {
        Self {
            scaleway,
            prefix: prefix.to_owned(),
            locks: VolumeLocks::new(),
        }
    }

    /// Gets a volume by name or creates it if it does not exist, trying the
    /// candidate zones in order.
    async fn get_or_create_volume(
        &self,
        name: &str,
        snapshot_id: Option<&str>,
        size: u64,
        perf_iops: Option<u32>,
        zones: Vec<Option<Zone>>,
    ) -> Result<Volume, scaleway::Error> {
        let zones = if zones.is_empty() { vec![None] } else { zones };

        for zone in &zones {
            match self.scaleway.get_volume_by_name(name, size, *zone).await {
                Ok(volume) => return Ok(volume),
                Err(scaleway::Error::VolumeNotFound) => {}
                Err(err) => return Err(err),
            }
        }

        let mut last_error = None;
        for zone in &zones {
            match self
                .scaleway
                .create_volume(name, snapshot_id, size, perf_iops, *zone)
                .await
            {
                Ok(volume) => return Ok(volume),
                Err(err) => {
                    warn!("failed to create volume {name} in zone {zone:?}: {err}");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(scaleway::Error::VolumeNotFound))
    }

    /// Gets a snapshot by name or creates it, then waits for it to be cut.
    async fn get_or_create_snapshot(
        &self,
        name: &str,
        source_volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, scaleway::Error> {
        let snapshot = match self
            .scaleway
            .get_snapshot_by_name(name, source_volume_id, zone)
            .await
        {
            Ok(snapshot) => snapshot,
            Err(scaleway::Error::SnapshotNotFound) => {
                self.scaleway
                    .create_snapshot(name, source_volume_id, zone)
                    .await?
            }
            Err(err) => return Err(err),
        };

        self.scaleway.wait_for_snapshot(&snapshot.id, zone).await
    }

    /// Creates a new volume. This operation is idempotent: a volume that
    /// already exists with the same name and size is returned as-is.
    pub async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, Status> {
        if req.name.is_empty() {
            return Err(Status::invalid_argument("name not provided"));
        }

        validate_volume_capabilities(&req.volume_capabilities, false).map_err(|err| {
            Status::invalid_argument(format!(
                "volumeCapabilities not supported: {}",
                err.message()
            ))
        })?;

        let (perf_iops, encrypted) = parse_create_volume_params(&req.parameters)
            .map_err(|err| {
                Status::invalid_argument(format!("invalid parameters: {}", err.message()))
            })?;

        let size = volume_request_capacity(req.capacity_range.as_ref()).map_err(|err| {
            Status::out_of_range(format!("capacityRange invalid: {}", err.message()))
        })?;

        let scw_volume_name = format!("{}{}", self.prefix, req.name);

        let mut snapshot_id = None;
        let mut snapshot_zone = None;
        if let Some(source) = req.volume_content_source.as_ref() {
            let VolumeContentSource::Snapshot {
                snapshot_id: source_id,
            } = source
            else {
                return Err(Status::invalid_argument(
                    "unsupported volumeContentSource type",
                ));
            };

            let (id, zone) = extract_id_and_zone(source_id).map_err(|err| {
                Status::invalid_argument(format!("invalid parameter snapshotID: {}", err.message()))
            })?;
            snapshot_id = Some(id);
            snapshot_zone = zone;
        }

        let chosen_zones = choose_zones(req.accessibility_requirements.as_ref(), snapshot_zone)
            .map_err(|err| {
                Status::new(
                    err.code(),
                    format!(
                        "unable to choose zone from accessibilityRequirements: {}",
                        err.message()
                    ),
                )
            })?;

        let volume = self
            .get_or_create_volume(
                &scw_volume_name,
                snapshot_id.as_deref(),
                size,
                perf_iops,
                chosen_zones.into_iter().map(Some).collect(),
            )
            .await
            .map_err(|err| status_from_scaleway_error("could not get or create volume", &err))?;

        let mut csi_volume = csi_volume(&volume);
        csi_volume.volume_context = HashMap::from([(
            ENCRYPTED_PARAMETER_KEY.to_owned(),
            encrypted.to_string(),
        )]);

        Ok(CreateVolumeResponse { volume: csi_volume })
    }

    /// Deprovisions a volume. This operation is idempotent: deleting a
    /// volume that no longer exists is a success.
    pub async fn delete_volume(
        &self,
        req: DeleteVolumeRequest,
    ) -> Result<DeleteVolumeResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;

        debug!(%volume_id, "deleting volume");
        if let Err(err) = self.scaleway.delete_volume(&volume_id, volume_zone).await {
            if err.is_not_found() {
                debug!(%volume_id, "volume already deleted");
                return Ok(DeleteVolumeResponse {});
            }
            return Err(status_from_scaleway_error("failed to delete volume", &err));
        }

        debug!(%volume_id, "volume deleted");
        Ok(DeleteVolumeResponse {})
    }

    /// Attaches the volume to the given node. This operation is idempotent:
    /// re-publishing a volume already attached to the node returns the same
    /// publish context.
    pub async fn controller_publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<ControllerPublishVolumeResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;
        let (node_id, node_zone) = extract_id_and_zone(&req.node_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter nodeID: {}", err.message()))
        })?;

        let _guard = self.locks.lock(&volume_id).await;

        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volumeCapability not provided"))?;
        validate_volume_capability(capability).map_err(|err| {
            Status::invalid_argument(format!("volumeCapability not supported: {}", err.message()))
        })?;

        let volume = self
            .scaleway
            .get_volume(&volume_id, volume_zone)
            .await
            .map_err(|err| status_from_scaleway_error("unable to get volume to publish", &err))?;

        let server = self
            .scaleway
            .get_server(&node_id, node_zone)
            .await
            .map_err(|err| {
                status_from_scaleway_error("unable to get server where to publish the volume", &err)
            })?;

        let publish_context = HashMap::from([
            (
                PUBLISH_CONTEXT_VOLUME_NAME_KEY.to_owned(),
                volume.name.clone(),
            ),
            (PUBLISH_CONTEXT_VOLUME_ID_KEY.to_owned(), volume.id.clone()),
            (
                PUBLISH_CONTEXT_VOLUME_ZONE_KEY.to_owned(),
                volume.zone.to_string(),
            ),
        ]);

        // Is the volume already attached?
        let volume_server_ids = published_node_ids(&volume);
        if let Some(attached_to) = volume_server_ids.first() {
            if *attached_to == expand_zonal_id(&server.id, server.zone) {
                return Ok(ControllerPublishVolumeResponse { publish_context });
            }

            return Err(Status::failed_precondition(format!(
                "volume {volume_id} already attached to another node {attached_to}"
            )));
        }

        if server.volumes.len() >= MAX_VOLUMES_PER_NODE {
            return Err(Status::resource_exhausted(format!(
                "max number of volumes reached for instance {node_id}"
            )));
        }

        self.scaleway
            .attach_volume(&node_id, &volume_id, volume_zone)
            .await
            .map_err(|err| {
                Status::internal(format!("failed to attach volume to instance: {err}"))
            })?;

        Ok(ControllerPublishVolumeResponse { publish_context })
    }

    /// Detaches the volume from the given node. This operation is
    /// idempotent: a volume that is not attached, or whose volume or server
    /// is gone, is a success.
    pub async fn controller_unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<ControllerUnpublishVolumeResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;
        let (node_id, node_zone) = extract_id_and_zone(&req.node_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter nodeID: {}", err.message()))
        })?;

        let _guard = self.locks.lock(&volume_id).await;

        let volume = match self.scaleway.get_volume(&volume_id, volume_zone).await {
            Ok(volume) => volume,
            Err(err) if err.is_not_found() => {
                return Ok(ControllerUnpublishVolumeResponse {})
            }
            Err(err) => {
                return Err(status_from_scaleway_error(
                    "failed to get volume to unpublish",
                    &err,
                ))
            }
        };

        // Skip if the volume is not attached.
        if published_node_ids(&volume).is_empty() {
            return Ok(ControllerUnpublishVolumeResponse {});
        }

        match self.scaleway.get_server(&node_id, node_zone).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                return Ok(ControllerUnpublishVolumeResponse {})
            }
            Err(err) => {
                return Err(status_from_scaleway_error(
                    "failed to get server where to unpublish volume",
                    &err,
                ))
            }
        }

        self.scaleway
            .detach_volume(&volume_id, volume_zone)
            .await
            .map_err(|err| Status::internal(format!("failed to detach volume: {err}")))?;

        Ok(ControllerUnpublishVolumeResponse {})
    }

    /// Confirms that a pre-provisioned volume supports the requested
    /// capabilities.
    pub async fn validate_volume_capabilities(
        &self,
        req: ValidateVolumeCapabilitiesRequest,
    ) -> Result<ValidateVolumeCapabilitiesResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;

        self.scaleway
            .get_volume(&volume_id, volume_zone)
            .await
            .map_err(|err| status_from_scaleway_error("failed to get volume", &err))?;

        validate_volume_capabilities(&req.volume_capabilities, false).map_err(|err| {
            Status::invalid_argument(format!("unsupported capabilities: {}", err.message()))
        })?;

        Ok(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(ValidateVolumeCapabilitiesConfirmed {
                volume_capabilities: req.volume_capabilities,
            }),
            message: String::new(),
        })
    }

    /// Lists volumes with opaque offset pagination.
    pub async fn list_volumes(
        &self,
        req: ListVolumesRequest,
    ) -> Result<ListVolumesResponse, Status> {
        let start = parse_starting_token(&req.starting_token)?;
        if req.max_entries < 0 {
            return Err(Status::invalid_argument(
                "maxEntries must be a positive number",
            ));
        }

        let (volumes, next) = self
            .scaleway
            .list_volumes(start, req.max_entries as u32)
            .await
            .map_err(|err| Status::internal(format!("failed to list volumes: {err}")))?;

        let entries = volumes
            .iter()
            .map(|volume| ListVolumesEntry {
                volume: csi_volume(volume),
                status: ListVolumesVolumeStatus {
                    published_node_ids: published_node_ids(volume),
                },
            })
            .collect();

        Ok(ListVolumesResponse {
            entries,
            next_token: next.unwrap_or_default(),
        })
    }

    /// Returns a single volume with its published nodes.
    pub async fn controller_get_volume(
        &self,
        req: ControllerGetVolumeRequest,
    ) -> Result<ControllerGetVolumeResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;

        let volume = self
            .scaleway
            .get_volume(&volume_id, volume_zone)
            .await
            .map_err(|err| status_from_scaleway_error("failed to get volume", &err))?;

        Ok(ControllerGetVolumeResponse {
            volume: csi_volume(&volume),
            status: ListVolumesVolumeStatus {
                published_node_ids: published_node_ids(&volume),
            },
        })
    }

    pub async fn controller_get_capabilities(
        &self,
        _req: ControllerGetCapabilitiesRequest,
    ) -> Result<ControllerGetCapabilitiesResponse, Status> {
        Ok(ControllerGetCapabilitiesResponse {
            capabilities: CONTROLLER_CAPABILITIES.to_vec(),
        })
    }

    /// Creates a snapshot of the given volume. This operation is idempotent:
    /// an existing snapshot with the same name and source is returned as-is.
    pub async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, Status> {
        let (source_volume_id, source_volume_zone) = extract_id_and_zone(&req.source_volume_id)
            .map_err(|err| {
                Status::invalid_argument(format!(
                    "invalid parameter sourceVolumeID: {}",
                    err.message()
                ))
            })?;

        let _guard = self.locks.lock(&source_volume_id).await;

        if req.name.is_empty() {
            return Err(Status::invalid_argument("name not provided"));
        }

        let snapshot = self
            .get_or_create_snapshot(&req.name, &source_volume_id, source_volume_zone)
            .await
            .map_err(|err| status_from_scaleway_error("unable to get or create snapshot", &err))?;

        // Fail if the snapshot ended in a state it cannot be restored from.
        if snapshot.status != SnapshotStatus::Available && snapshot.status != SnapshotStatus::InUse
        {
            return Err(Status::internal(format!(
                "snapshot {} has an unexpected status: {}",
                snapshot.id, snapshot.status
            )));
        }

        Ok(CreateSnapshotResponse {
            snapshot: csi_snapshot(&snapshot),
        })
    }

    /// Deletes the given snapshot. Not-found is a success.
    pub async fn delete_snapshot(
        &self,
        req: DeleteSnapshotRequest,
    ) -> Result<DeleteSnapshotResponse, Status> {
        let (snapshot_id, snapshot_zone) = extract_id_and_zone(&req.snapshot_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter snapshotID: {}", err.message()))
        })?;

        if let Err(err) = self
            .scaleway
            .delete_snapshot(&snapshot_id, snapshot_zone)
            .await
        {
            if err.is_not_found() {
                debug!(%snapshot_id, "snapshot already deleted");
                return Ok(DeleteSnapshotResponse {});
            }
            return Err(status_from_scaleway_error("unable to delete snapshot", &err));
        }

        Ok(DeleteSnapshotResponse {})
    }

    /// Lists snapshots. Three modes by precedence: by snapshot ID, by source
    /// volume ID, full listing.
    pub async fn list_snapshots(
        &self,
        req: ListSnapshotsRequest,
    ) -> Result<ListSnapshotsResponse, Status> {
        let start = parse_starting_token(&req.starting_token)?;
        if req.max_entries < 0 {
            return Err(Status::invalid_argument(
                "maxEntries must be a positive number",
            ));
        }

        let mut snapshots = Vec::new();
        let mut next = None;

        if !req.snapshot_id.is_empty() {
            let (snapshot_id, snapshot_zone) =
                extract_id_and_zone(&req.snapshot_id).map_err(|err| {
                    Status::invalid_argument(format!(
                        "invalid parameter snapshotID: {}",
                        err.message()
                    ))
                })?;

            match self.scaleway.get_snapshot(&snapshot_id, snapshot_zone).await {
                Ok(snapshot) => snapshots.push(snapshot),
                // An unknown snapshot yields an empty list, not an error.
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    return Err(status_from_scaleway_error(
                        &format!("failed to get snapshot {:?}", req.snapshot_id),
                        &err,
                    ))
                }
            }
        } else if !req.source_volume_id.is_empty() {
            let (source_volume_id, source_volume_zone) = extract_id_and_zone(&req.source_volume_id)
                .map_err(|err| {
                    Status::invalid_argument(format!(
                        "invalid parameter sourceVolumeID: {}",
                        err.message()
                    ))
                })?;

            let (listed, token) = self
                .scaleway
                .list_snapshots_by_source_volume(
                    start,
                    req.max_entries as u32,
                    &source_volume_id,
                    source_volume_zone,
                )
                .await
                .map_err(|err| {
                    status_from_scaleway_error(
                        &format!("failed to get snapshots for volume {:?}", req.source_volume_id),
                        &err,
                    )
                })?;
            snapshots.extend(listed);
            next = token;
        } else {
            let (listed, token) = self
                .scaleway
                .list_snapshots(start, req.max_entries as u32)
                .await
                .map_err(|err| status_from_scaleway_error("failed to list snapshots", &err))?;
            snapshots.extend(listed);
            next = token;
        }

        let entries = snapshots
            .iter()
            .map(|snapshot| ListSnapshotsEntry {
                snapshot: csi_snapshot(snapshot),
            })
            .collect();

        Ok(ListSnapshotsResponse {
            entries,
            next_token: next.unwrap_or_default(),
        })
    }

    /// Grows the given volume. Never shrinks: a request below the current
    /// size is a no-op returning the current size.
    pub async fn controller_expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, Status> {
        let (volume_id, volume_zone) = extract_id_and_zone(&req.volume_id).map_err(|err| {
            Status::invalid_argument(format!("invalid parameter volumeID: {}", err.message()))
        })?;

        let _guard = self.locks.lock(&volume_id).await;

        let mut node_expansion_required = true;
        if let Some(capability) = req.volume_capability.as_ref() {
            let (block, _) = validate_volume_capability(capability).map_err(|err| {
                Status::invalid_argument(format!(
                    "volumeCapabilities not supported: {}",
                    err.message()
                ))
            })?;
            if block {
                node_expansion_required = false;
            }
        }

        let volume = self
            .scaleway
            .get_volume(&volume_id, volume_zone)
            .await
            .map_err(|err| {
                status_from_scaleway_error("failed to get volume that will be expanded", &err)
            })?;

        let new_size = volume_request_capacity(req.capacity_range.as_ref()).map_err(|err| {
            Status::out_of_range(format!("capacityRange invalid: {}", err.message()))
        })?;

        if volume.size >= new_size {
            // Volume is already larger than or equal to the target capacity.
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: size_to_i64(volume.size),
                node_expansion_required,
            });
        }

        self.scaleway
            .resize_volume(&volume_id, volume_zone, new_size)
            .await
            .map_err(|err| status_from_scaleway_error("failed to resize volume", &err))?;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: size_to_i64(new_size),
            node_expansion_required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csi::proto::{
        AccessMode, CapacityRange, Code, Topology, TopologyRequirement, VolumeCapability,
    };
    use crate::csi::util::ZONE_TOPOLOGY_KEY;
    use crate::scaleway::{Fake, Server, ServerVolume};

    const GB: i64 = 1_000_000_000;

    fn fake_server(zone: Zone) -> Server {
        Server {
            id: uuid::Uuid::new_v4().to_string(),
            name: "node-1".to_owned(),
            zone,
            volumes: HashMap::from([(
                "0".to_owned(),
                ServerVolume {
                    id: uuid::Uuid::new_v4().to_string(),
                    volume_type: "l_ssd".to_owned(),
                    boot: Some(true),
                },
            )]),
        }
    }

    fn controller_with(servers: Vec<Server>) -> (ControllerService, Arc<Fake>) {
        let fake = Arc::new(Fake::new(servers, None));
        let controller = ControllerService::with_client(Arc::clone(&fake) as Arc<dyn Api>, "");
        (controller, fake)
    }

    fn create_request(name: &str, size: i64) -> CreateVolumeRequest {
        CreateVolumeRequest {
            name: name.to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: size,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![VolumeCapability::mount(
                "ext4",
                &[],
                AccessMode::SingleNodeWriter,
            )],
            ..Default::default()
        }
    }

    fn capability() -> VolumeCapability {
        VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter)
    }

    #[tokio::test]
    async fn create_volume_is_idempotent() {
        let (controller, _) = controller_with(Vec::new());

        let first = controller
            .create_volume(create_request("pvc-1", 10 * GB))
            .await
            .expect("first create");
        let second = controller
            .create_volume(create_request("pvc-1", 10 * GB))
            .await
            .expect("second create");

        assert_eq!(first.volume.volume_id, second.volume.volume_id);
        assert_eq!(first.volume.capacity_bytes, second.volume.capacity_bytes);
        assert_eq!(
            first.volume.volume_context.get(ENCRYPTED_PARAMETER_KEY),
            Some(&"false".to_owned())
        );
    }

    #[tokio::test]
    async fn create_volume_same_name_different_size_is_already_exists() {
        let (controller, _) = controller_with(Vec::new());

        controller
            .create_volume(create_request("pvc-1", 10 * GB))
            .await
            .expect("create");
        let err = controller
            .create_volume(create_request("pvc-1", 20 * GB))
            .await
            .expect_err("size conflict");
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn create_volume_validates_input() {
        let (controller, _) = controller_with(Vec::new());

        let mut no_name = create_request("", 10 * GB);
        no_name.name = String::new();
        assert_eq!(
            controller
                .create_volume(no_name)
                .await
                .expect_err("empty name")
                .code(),
            Code::InvalidArgument
        );

        let mut no_caps = create_request("pvc-1", 10 * GB);
        no_caps.volume_capabilities.clear();
        assert_eq!(
            controller
                .create_volume(no_caps)
                .await
                .expect_err("no caps")
                .code(),
            Code::InvalidArgument
        );

        let mut bad_param = create_request("pvc-1", 10 * GB);
        bad_param
            .parameters
            .insert("color".to_owned(), "blue".to_owned());
        assert_eq!(
            controller
                .create_volume(bad_param)
                .await
                .expect_err("unknown parameter")
                .code(),
            Code::InvalidArgument
        );

        let mut bad_range = create_request("pvc-1", 10 * GB);
        bad_range.capacity_range = Some(CapacityRange {
            required_bytes: 10 * GB,
            limit_bytes: 5 * GB,
        });
        assert_eq!(
            controller
                .create_volume(bad_range)
                .await
                .expect_err("contradictory range")
                .code(),
            Code::OutOfRange
        );
    }

    #[tokio::test]
    async fn create_volume_carries_encrypted_context() {
        let (controller, _) = controller_with(Vec::new());

        let mut req = create_request("pvc-crypted", 10 * GB);
        req.parameters
            .insert("encrypted".to_owned(), "true".to_owned());
        let resp = controller.create_volume(req).await.expect("create");
        assert_eq!(
            resp.volume.volume_context.get(ENCRYPTED_PARAMETER_KEY),
            Some(&"true".to_owned())
        );
    }

    #[tokio::test]
    async fn create_from_snapshot_reflects_content_source() {
        let (controller, fake) = controller_with(Vec::new());

        let source = fake
            .create_volume("source", None, 10_000_000_000, None, Some(Zone::FrPar1))
            .await
            .expect("source volume");
        let snapshot = fake
            .create_snapshot("snap", &source.id, Some(Zone::FrPar1))
            .await
            .expect("snapshot");

        let mut req = create_request("restored", 10 * GB);
        req.volume_content_source = Some(VolumeContentSource::Snapshot {
            snapshot_id: format!("fr-par-1/{}", snapshot.id),
        });
        let resp = controller.create_volume(req).await.expect("restore");

        assert_eq!(
            resp.volume.content_source,
            Some(VolumeContentSource::Snapshot {
                snapshot_id: format!("fr-par-1/{}", snapshot.id)
            })
        );
        assert!(resp.volume.volume_id.starts_with("fr-par-1/"));
    }

    #[tokio::test]
    async fn create_from_snapshot_with_incompatible_topology_is_exhausted() {
        let (controller, fake) = controller_with(Vec::new());

        let source = fake
            .create_volume("source", None, 10_000_000_000, None, Some(Zone::FrPar1))
            .await
            .expect("source volume");
        let snapshot = fake
            .create_snapshot("snap", &source.id, Some(Zone::FrPar1))
            .await
            .expect("snapshot");

        let mut req = create_request("restored", 10 * GB);
        req.volume_content_source = Some(VolumeContentSource::Snapshot {
            snapshot_id: format!("fr-par-1/{}", snapshot.id),
        });
        req.accessibility_requirements = Some(TopologyRequirement {
            requisite: Vec::new(),
            preferred: vec![Topology {
                segments: HashMap::from([(
                    ZONE_TOPOLOGY_KEY.to_owned(),
                    "fr-par-2".to_owned(),
                )]),
            }],
        });

        let err = controller
            .create_volume(req)
            .await
            .expect_err("zone mismatch");
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn delete_volume_not_found_is_success() {
        let (controller, _) = controller_with(Vec::new());

        // A well-formed but unknown ID.
        controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: format!("fr-par-1/{}", uuid::Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .expect("unknown volume is a success");

        // A malformed ID never reaches the API and still succeeds.
        controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: "this-is-not-a-uuid".to_owned(),
                ..Default::default()
            })
            .await
            .expect("malformed id is a success");
    }

    #[tokio::test]
    async fn delete_attached_volume_is_failed_precondition() {
        let server = fake_server(Zone::FrPar1);
        let server_id = server.id.clone();
        let (controller, fake) = controller_with(vec![server]);

        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");
        fake.attach_volume(&server_id, &volume.id, None)
            .await
            .expect("attach");

        let err = controller
            .delete_volume(DeleteVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                ..Default::default()
            })
            .await
            .expect_err("attached volume");
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn publish_is_idempotent_and_exclusive() {
        let server_a = fake_server(Zone::FrPar1);
        let server_b = fake_server(Zone::FrPar1);
        let (id_a, id_b) = (server_a.id.clone(), server_b.id.clone());
        let (controller, fake) = controller_with(vec![server_a, server_b]);

        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let publish = ControllerPublishVolumeRequest {
            volume_id: format!("fr-par-1/{}", volume.id),
            node_id: format!("fr-par-1/{id_a}"),
            volume_capability: Some(capability()),
            ..Default::default()
        };

        let first = controller
            .controller_publish_volume(publish.clone())
            .await
            .expect("publish");
        assert_eq!(
            first.publish_context.get(PUBLISH_CONTEXT_VOLUME_ID_KEY),
            Some(&volume.id)
        );
        assert_eq!(
            first.publish_context.get(PUBLISH_CONTEXT_VOLUME_ZONE_KEY),
            Some(&"fr-par-1".to_owned())
        );

        // Publishing again to the same node returns the same context.
        let second = controller
            .controller_publish_volume(publish)
            .await
            .expect("republish");
        assert_eq!(first.publish_context, second.publish_context);

        // Publishing to another node is refused while attached.
        let err = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                node_id: format!("fr-par-1/{id_b}"),
                volume_capability: Some(capability()),
                ..Default::default()
            })
            .await
            .expect_err("attached elsewhere");
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn publish_seventeenth_volume_is_resource_exhausted() {
        let mut server = fake_server(Zone::FrPar1);
        for i in 1..MAX_VOLUMES_PER_NODE {
            server.volumes.insert(
                i.to_string(),
                ServerVolume {
                    id: uuid::Uuid::new_v4().to_string(),
                    volume_type: "sbs_volume".to_owned(),
                    boot: None,
                },
            );
        }
        let server_id = server.id.clone();
        let (controller, fake) = controller_with(vec![server]);

        let volume = fake
            .create_volume("vol-17", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let err = controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                node_id: format!("fr-par-1/{server_id}"),
                volume_capability: Some(capability()),
                ..Default::default()
            })
            .await
            .expect_err("full node");
        assert_eq!(err.code(), Code::ResourceExhausted);
    }

    #[tokio::test]
    async fn unpublish_is_idempotent() {
        let server = fake_server(Zone::FrPar1);
        let server_id = server.id.clone();
        let (controller, fake) = controller_with(vec![server]);

        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");
        fake.attach_volume(&server_id, &volume.id, None)
            .await
            .expect("attach");

        let unpublish = ControllerUnpublishVolumeRequest {
            volume_id: format!("fr-par-1/{}", volume.id),
            node_id: format!("fr-par-1/{server_id}"),
            ..Default::default()
        };
        controller
            .controller_unpublish_volume(unpublish.clone())
            .await
            .expect("unpublish");

        // Not attached anymore: still a success.
        controller
            .controller_unpublish_volume(unpublish)
            .await
            .expect("unpublish again");

        // Unknown volume: still a success.
        controller
            .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
                volume_id: format!("fr-par-1/{}", uuid::Uuid::new_v4()),
                node_id: format!("fr-par-1/{server_id}"),
                ..Default::default()
            })
            .await
            .expect("unknown volume");
    }

    #[tokio::test]
    async fn expand_never_shrinks() {
        let (controller, fake) = controller_with(Vec::new());

        let volume = fake
            .create_volume("vol", None, 20_000_000_000, None, None)
            .await
            .expect("create");

        let resp = controller
            .controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                capacity_range: Some(CapacityRange {
                    required_bytes: 10 * GB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            })
            .await
            .expect("no-op expand");
        assert_eq!(resp.capacity_bytes, 20 * GB);
        assert!(resp.node_expansion_required);

        let resp = controller
            .controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                capacity_range: Some(CapacityRange {
                    required_bytes: 30 * GB,
                    limit_bytes: 0,
                }),
                ..Default::default()
            })
            .await
            .expect("grow");
        assert_eq!(resp.capacity_bytes, 30 * GB);

        let grown = fake.get_volume(&volume.id, None).await.expect("get");
        assert_eq!(grown.size, 30_000_000_000);
    }

    #[tokio::test]
    async fn expand_block_volume_needs_no_node_expansion() {
        let (controller, fake) = controller_with(Vec::new());

        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let resp = controller
            .controller_expand_volume(ControllerExpandVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
                capacity_range: Some(CapacityRange {
                    required_bytes: 20 * GB,
                    limit_bytes: 0,
                }),
                volume_capability: Some(VolumeCapability::block(AccessMode::SingleNodeWriter)),
                ..Default::default()
            })
            .await
            .expect("expand");
        assert!(!resp.node_expansion_required);
    }

    #[tokio::test]
    async fn snapshot_lifecycle_is_idempotent() {
        let (controller, fake) = controller_with(Vec::new());

        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");
        let other = fake
            .create_volume("other", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let req = CreateSnapshotRequest {
            source_volume_id: format!("fr-par-1/{}", volume.id),
            name: "backup".to_owned(),
            ..Default::default()
        };
        let first = controller
            .create_snapshot(req.clone())
            .await
            .expect("snapshot");
        assert!(first.snapshot.ready_to_use);
        assert_eq!(
            first.snapshot.source_volume_id,
            format!("fr-par-1/{}", volume.id)
        );

        let second = controller.create_snapshot(req).await.expect("again");
        assert_eq!(first.snapshot.snapshot_id, second.snapshot.snapshot_id);

        // Same name, other source volume.
        let err = controller
            .create_snapshot(CreateSnapshotRequest {
                source_volume_id: format!("fr-par-1/{}", other.id),
                name: "backup".to_owned(),
                ..Default::default()
            })
            .await
            .expect_err("name conflict");
        assert_eq!(err.code(), Code::AlreadyExists);

        // Delete, then delete again.
        let delete = DeleteSnapshotRequest {
            snapshot_id: first.snapshot.snapshot_id.clone(),
            ..Default::default()
        };
        controller
            .delete_snapshot(delete.clone())
            .await
            .expect("delete");
        controller
            .delete_snapshot(delete)
            .await
            .expect("delete again");
    }

    #[tokio::test]
    async fn list_snapshots_modes() {
        let (controller, fake) = controller_with(Vec::new());

        let volume_a = fake
            .create_volume("a", None, 10_000_000_000, None, None)
            .await
            .expect("create");
        let volume_b = fake
            .create_volume("b", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let snap_a = fake
            .create_snapshot("snap-a", &volume_a.id, None)
            .await
            .expect("snap-a");
        fake.create_snapshot("snap-b1", &volume_b.id, None)
            .await
            .expect("snap-b1");
        fake.create_snapshot("snap-b2", &volume_b.id, None)
            .await
            .expect("snap-b2");

        // By snapshot ID: at most one entry.
        let by_id = controller
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: format!("fr-par-1/{}", snap_a.id),
                ..Default::default()
            })
            .await
            .expect("by id");
        assert_eq!(by_id.entries.len(), 1);

        // Unknown snapshot ID: empty list, no error.
        let unknown = controller
            .list_snapshots(ListSnapshotsRequest {
                snapshot_id: format!("fr-par-1/{}", uuid::Uuid::new_v4()),
                ..Default::default()
            })
            .await
            .expect("unknown id");
        assert!(unknown.entries.is_empty());

        // By source volume.
        let by_source = controller
            .list_snapshots(ListSnapshotsRequest {
                source_volume_id: format!("fr-par-1/{}", volume_b.id),
                ..Default::default()
            })
            .await
            .expect("by source");
        assert_eq!(by_source.entries.len(), 2);

        // Full listing follows the pagination token.
        let mut collected = Vec::new();
        let mut token = String::new();
        loop {
            let page = controller
                .list_snapshots(ListSnapshotsRequest {
                    max_entries: 2,
                    starting_token: token.clone(),
                    ..Default::default()
                })
                .await
                .expect("page");
            collected.extend(page.entries.into_iter().map(|e| e.snapshot.snapshot_id));
            if page.next_token.is_empty() {
                break;
            }
            token = page.next_token;
        }
        assert_eq!(collected.len(), 3);
    }

    #[tokio::test]
    async fn list_volumes_reports_published_nodes() {
        let server = fake_server(Zone::FrPar1);
        let server_id = server.id.clone();
        let (controller, fake) = controller_with(vec![server]);

        let attached = fake
            .create_volume("attached", None, 10_000_000_000, None, None)
            .await
            .expect("create");
        fake.attach_volume(&server_id, &attached.id, None)
            .await
            .expect("attach");
        fake.create_volume("loose", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let listed = controller
            .list_volumes(ListVolumesRequest::default())
            .await
            .expect("list");
        assert_eq!(listed.entries.len(), 2);

        let entry = listed
            .entries
            .iter()
            .find(|e| e.volume.volume_id.ends_with(&attached.id))
            .expect("attached entry");
        assert_eq!(
            entry.status.published_node_ids,
            vec![format!("fr-par-1/{server_id}")]
        );

        let err = controller
            .list_volumes(ListVolumesRequest {
                starting_token: "junk".to_owned(),
                ..Default::default()
            })
            .await
            .expect_err("bad token");
        assert_eq!(err.code(), Code::Aborted);
    }

    #[tokio::test]
    async fn get_volume_returns_status() {
        let (controller, fake) = controller_with(Vec::new());
        let volume = fake
            .create_volume("vol", None, 10_000_000_000, None, None)
            .await
            .expect("create");

        let resp = controller
            .controller_get_volume(ControllerGetVolumeRequest {
                volume_id: format!("fr-par-1/{}", volume.id),
            })
            .await
            .expect("get");
        assert_eq!(resp.volume.capacity_bytes, 10 * GB);
        assert!(resp.status.published_node_ids.is_empty());

        let caps = controller
            .controller_get_capabilities(ControllerGetCapabilitiesRequest {})
            .await
            .expect("capabilities");
        assert!(caps
            .capabilities
            .contains(&ControllerCapability::ExpandVolume));
    }

    #[tokio::test]
    async fn racing_creates_converge_on_one_volume() {
        let (controller, fake) = controller_with(Vec::new());
        let controller = Arc::new(controller);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let controller = Arc::clone(&controller);
            handles.push(tokio::spawn(async move {
                controller
                    .create_volume(create_request("pvc-race", 10 * GB))
                    .await
            }));
        }

        let mut ids = Vec::new();
        for handle in handles {
            let resp = handle.await.expect("task").expect("create");
            ids.push(resp.volume.volume_id);
        }

        // Name uniqueness is enforced by the service, every racer converges
        // on the same volume without a per-name lock in the plugin.
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(fake.volume_count(), 1);
    }
}
