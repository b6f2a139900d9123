//! The CSI node service: stage, publish, stats and expansion of volumes on
//! the node where they are consumed.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::diskutils::{create_mount_point, DiskError, DiskUtils, SysDiskUtils};
use super::proto::{
    AccessType, NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse,
    NodeGetCapabilitiesRequest, NodeGetCapabilitiesResponse, NodeGetInfoRequest,
    NodeGetInfoResponse, NodeGetVolumeStatsRequest, NodeGetVolumeStatsResponse,
    NodePublishVolumeRequest, NodePublishVolumeResponse, NodeStageVolumeRequest,
    NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Status, Topology, UsageUnit, VolumeUsage,
};
use super::util::{
    self, attached_scratch_volumes, extract_id_and_zone, is_volume_encrypted,
    validate_volume_capability, ENCRYPTION_PASSPHRASE_KEY, PUBLISH_CONTEXT_VOLUME_ID_KEY,
    PUBLISH_CONTEXT_VOLUME_NAME_KEY, ZONE_TOPOLOGY_KEY,
};
use crate::scaleway::{self, Zone};

/// Node capabilities advertised to the CO.
const NODE_CAPABILITIES: [NodeCapability; 4] = [
    NodeCapability::StageUnstageVolume,
    NodeCapability::GetVolumeStats,
    NodeCapability::ExpandVolume,
    NodeCapability::SingleNodeMultiWriter,
];

/// The CSI node service. Runs on the instance where volumes are consumed.
pub struct NodeService {
    disk_utils: Arc<dyn DiskUtils>,
    node_id: String,
    node_zone: Zone,
    max_volumes_per_node: i64,
}

impl NodeService {
    /// Builds the node service from the local instance metadata.
    pub async fn from_metadata() -> anyhow::Result<Self> {
        let metadata = scaleway::get_metadata().await?;
        let zone = metadata.zone()?;
        let reserved = attached_scratch_volumes(&metadata);

        Self::new(Arc::new(SysDiskUtils::new()), &metadata.id, zone, reserved)
    }

    /// Builds the node service with explicit dependencies, used by tests.
    pub fn new(
        disk_utils: Arc<dyn DiskUtils>,
        node_id: &str,
        node_zone: Zone,
        reserved_scratch_volumes: usize,
    ) -> anyhow::Result<Self> {
        let max_volumes_per_node = util::max_volumes_per_node(reserved_scratch_volumes)
            .map_err(|status| anyhow::anyhow!(status.message().to_owned()))?;

        Ok(Self {
            disk_utils,
            node_id: node_id.to_owned(),
            node_zone,
            max_volumes_per_node,
        })
    }

    pub async fn node_stage_volume(
        &self,
        req: NodeStageVolumeRequest,
    ) -> Result<NodeStageVolumeResponse, Status> {
        let (volume_id, _) = extract_id_and_zone(&req.volume_id)
            .map_err(|err| Status::invalid_argument(format!("invalid parameter volumeID: {err}")))?;

        let encrypted = is_volume_encrypted(&req.volume_context)
            .map_err(|err| Status::invalid_argument(format!("invalid volumeContext: {err}")))?;

        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("stagingTargetPath not provided"));
        }
        let staging_target_path = Path::new(&req.staging_target_path);

        let volume_capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volumeCapability not provided"))?;
        let (block, _) = validate_volume_capability(volume_capability).map_err(|err| {
            Status::invalid_argument(format!("volumeCapability not supported: {}", err.message()))
        })?;

        let volume_name = req
            .publish_context
            .get(PUBLISH_CONTEXT_VOLUME_NAME_KEY)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "{PUBLISH_CONTEXT_VOLUME_NAME_KEY} not found in publish context of volume {volume_id}"
                ))
            })?;

        let scw_volume_id = req
            .publish_context
            .get(PUBLISH_CONTEXT_VOLUME_ID_KEY)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "{PUBLISH_CONTEXT_VOLUME_ID_KEY} not found in publish context of volume {volume_id}"
                ))
            })?;

        let mut device_path =
            self.disk_utils
                .get_device_path(scw_volume_id)
                .map_err(|err| match err {
                    DiskError::DeviceNotFound(_) => Status::not_found(format!(
                        "volume {volume_id} is not mounted on node yet"
                    )),
                    other => Status::internal(format!(
                        "error getting device path for volume with ID {volume_id}: {other}"
                    )),
                })?;
        debug!(
            %volume_name,
            %volume_id,
            device = %device_path.display(),
            "volume has device path"
        );

        if encrypted {
            let passphrase = req.secrets.get(ENCRYPTION_PASSPHRASE_KEY).ok_or_else(|| {
                Status::invalid_argument(format!(
                    "missing passphrase secret for key {ENCRYPTION_PASSPHRASE_KEY}"
                ))
            })?;
            device_path = self
                .disk_utils
                .encrypt_and_open_device(scw_volume_id, passphrase)
                .await
                .map_err(|err| {
                    Status::internal(format!(
                        "error encrypting/opening volume with ID {volume_id}: {err}"
                    ))
                })?;
        }

        if block {
            // Raw block volumes are not mounted at the staging path.
            return Ok(NodeStageVolumeResponse {});
        }

        if self.disk_utils.is_mounted(staging_target_path) {
            let block_device = self
                .disk_utils
                .is_block_device(staging_target_path)
                .map_err(|err| {
                    Status::internal(format!(
                        "error checking stat for {}: {err}",
                        staging_target_path.display()
                    ))
                })?;
            if block_device {
                // A block device mounted at the staging path is not normal.
                return Err(Status::unknown(format!(
                    "block device mounted as stagingTargetPath {} for volume with ID {volume_id}",
                    staging_target_path.display()
                )));
            }
            debug!(
                %volume_name,
                %volume_id,
                staging = %staging_target_path.display(),
                "volume is already mounted on staging path"
            );
            return Ok(NodeStageVolumeResponse {});
        }

        let (fs_type, mut mount_options) = match volume_capability.access_type.as_ref() {
            Some(AccessType::Mount(mount)) => (mount.fs_type.clone(), mount.mount_flags.clone()),
            _ => return Err(Status::invalid_argument("mount volume capability is nil")),
        };

        // Volumes cloned from a snapshot carry the source filesystem UUID,
        // xfs refuses to mount the duplicate without nouuid.
        if fs_type == "xfs" {
            mount_options.push("nouuid".to_owned());
        }

        debug!(
            %volume_name,
            %volume_id,
            staging = %staging_target_path.display(),
            fs_type,
            options = mount_options.join(","),
            "mounting volume"
        );

        self.disk_utils
            .format_and_mount(staging_target_path, &device_path, &fs_type, &mount_options)
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "failed to format and mount device from ({}) to ({}) with fstype ({fs_type}) and options ({}): {err}",
                    device_path.display(),
                    staging_target_path.display(),
                    mount_options.join(","),
                ))
            })?;

        // Grow the filesystem opportunistically for the restored-from-snapshot
        // case. The LUKS device is already sized right after open, so no
        // passphrase is needed.
        self.disk_utils
            .resize(staging_target_path, &device_path, None)
            .await
            .map_err(|err| Status::internal(format!("failed to resize volume: {err}")))?;

        Ok(NodeStageVolumeResponse {})
    }

    pub async fn node_unstage_volume(
        &self,
        req: NodeUnstageVolumeRequest,
    ) -> Result<NodeUnstageVolumeResponse, Status> {
        let (volume_id, _) = extract_id_and_zone(&req.volume_id)
            .map_err(|err| Status::invalid_argument(format!("invalid parameter volumeID: {err}")))?;

        if req.staging_target_path.is_empty() {
            return Err(Status::invalid_argument("stagingTargetPath not provided"));
        }
        let staging_target_path = Path::new(&req.staging_target_path);

        if let Err(err) = self.disk_utils.get_device_path(&volume_id) {
            return Err(match err {
                DiskError::DeviceNotFound(_) => {
                    Status::not_found(format!("volume with ID {volume_id} not found"))
                }
                other => Status::internal(format!(
                    "error getting device path for volume with ID {volume_id}: {other}"
                )),
            });
        }

        if self.disk_utils.is_mounted(staging_target_path) {
            debug!(
                %volume_id,
                staging = %staging_target_path.display(),
                "unmounting staged volume"
            );
            self.disk_utils
                .unmount(staging_target_path)
                .await
                .map_err(|err| Status::internal(format!("error unmounting target path: {err}")))?;
        }

        self.disk_utils
            .close_device(&volume_id)
            .await
            .map_err(|err| {
                Status::internal(format!("error closing device with ID {volume_id}: {err}"))
            })?;

        Ok(NodeUnstageVolumeResponse {})
    }

    pub async fn node_publish_volume(
        &self,
        req: NodePublishVolumeRequest,
    ) -> Result<NodePublishVolumeResponse, Status> {
        let (volume_id, _) = extract_id_and_zone(&req.volume_id)
            .map_err(|err| Status::invalid_argument(format!("invalid parameter volumeID: {err}")))?;

        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("targetPath not provided"));
        }
        let target_path = Path::new(&req.target_path);

        let volume_capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Status::invalid_argument("volumeCapability not provided"))?;
        let (block, mount) = validate_volume_capability(volume_capability).map_err(|err| {
            Status::invalid_argument(format!("volumeCapability not supported: {}", err.message()))
        })?;

        if req.staging_target_path.is_empty() {
            return Err(Status::failed_precondition("stagingTargetPath not provided"));
        }

        let scw_volume_id = req
            .publish_context
            .get(PUBLISH_CONTEXT_VOLUME_ID_KEY)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "{PUBLISH_CONTEXT_VOLUME_ID_KEY} not found for volume with ID {volume_id}"
                ))
            })?;
        let volume_name = req
            .publish_context
            .get(PUBLISH_CONTEXT_VOLUME_NAME_KEY)
            .ok_or_else(|| {
                Status::invalid_argument(format!(
                    "{PUBLISH_CONTEXT_VOLUME_NAME_KEY} not provided in publishContext"
                ))
            })?;

        let mut device_path = self
            .disk_utils
            .get_device_path(scw_volume_id)
            .map_err(|err| Status::not_found(format!("volume {volume_id} not found: {err}")))?;

        let encrypted = is_volume_encrypted(&req.volume_context)
            .map_err(|err| Status::invalid_argument(format!("invalid volumeContext: {err}")))?;

        if encrypted {
            device_path = self
                .disk_utils
                .get_mapped_device_path(scw_volume_id)
                .await
                .map_err(|err| {
                    Status::internal(format!(
                        "error getting mapped device for encrypted device {}: {err}",
                        device_path.display()
                    ))
                })?
                .ok_or_else(|| {
                    Status::internal(format!("encrypted volume with ID {volume_id} is not open"))
                })?;
        }

        if self.disk_utils.is_mounted(target_path) {
            let block_device = self.disk_utils.is_block_device(target_path).map_err(|err| {
                Status::internal(format!(
                    "error checking stat for {}: {err}",
                    target_path.display()
                ))
            })?;
            if block_device && mount || !block_device && block {
                return Err(Status::already_exists("cannot change volumeCapability type"));
            }

            debug!(
                %volume_name,
                %volume_id,
                target = %target_path.display(),
                "volume is already published"
            );
            return Ok(NodePublishVolumeResponse {});
        }

        let mut mount_options = vec!["bind".to_owned()];
        let (source_path, fs_type) = if block {
            (device_path.clone(), String::new())
        } else {
            let fs_type = match volume_capability.access_type.as_ref() {
                Some(AccessType::Mount(mount)) => {
                    mount_options.extend(mount.mount_flags.iter().cloned());
                    mount.fs_type.clone()
                }
                _ => String::new(),
            };
            (PathBuf::from(&req.staging_target_path), fs_type)
        };

        if req.readonly {
            mount_options.push("ro".to_owned());
        }

        create_mount_point(target_path, block).await.map_err(|err| {
            Status::internal(format!(
                "error creating mount point {} for volume with ID {volume_id}: {err}",
                target_path.display()
            ))
        })?;

        self.disk_utils
            .mount_to_target(&source_path, target_path, &fs_type, &mount_options)
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "error mounting source {} to target {} with fs of type {fs_type}: {err}",
                    source_path.display(),
                    target_path.display()
                ))
            })?;

        Ok(NodePublishVolumeResponse {})
    }

    pub async fn node_unpublish_volume(
        &self,
        req: NodeUnpublishVolumeRequest,
    ) -> Result<NodeUnpublishVolumeResponse, Status> {
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volumeID not provided"));
        }
        if req.target_path.is_empty() {
            return Err(Status::invalid_argument("targetPath not provided"));
        }

        // Repeated calls and non-existent paths are fine, unmount is a no-op
        // when the target is not mounted.
        self.disk_utils
            .unmount(Path::new(&req.target_path))
            .await
            .map_err(|err| Status::internal(format!("error unmounting target path: {err}")))?;

        Ok(NodeUnpublishVolumeResponse {})
    }

    pub async fn node_get_volume_stats(
        &self,
        req: NodeGetVolumeStatsRequest,
    ) -> Result<NodeGetVolumeStatsResponse, Status> {
        let (volume_id, _) = extract_id_and_zone(&req.volume_id)
            .map_err(|err| Status::invalid_argument(format!("invalid parameter volumeID: {err}")))?;

        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volumePath not provided"));
        }

        let volume_path = if req.staging_target_path.is_empty() {
            Path::new(&req.volume_path)
        } else {
            Path::new(&req.staging_target_path)
        };

        if !self.disk_utils.is_mounted(volume_path) {
            return Err(Status::not_found(format!(
                "volume with ID {volume_id} not mounted to {}",
                req.volume_path
            )));
        }

        if let Err(err) = self.disk_utils.get_device_path(&volume_id) {
            return Err(match err {
                DiskError::DeviceNotFound(_) => {
                    Status::not_found(format!("volume with ID {volume_id} not found"))
                }
                other => Status::internal(format!(
                    "error getting device path for volume with ID {volume_id}: {other}"
                )),
            });
        }

        let stats = self.disk_utils.get_statfs(volume_path).map_err(|err| {
            Status::internal(format!(
                "error doing stat on {}: {err}",
                volume_path.display()
            ))
        })?;

        let total_bytes = util::size_to_i64(stats.blocks) * stats.block_size;
        let available_bytes = util::size_to_i64(stats.blocks_free) * stats.block_size;
        let used_bytes = total_bytes - available_bytes;

        let total_inodes = util::size_to_i64(stats.files);
        let free_inodes = util::size_to_i64(stats.files_free);
        let used_inodes = total_inodes - free_inodes;

        Ok(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: total_bytes,
                    available: available_bytes,
                    used: used_bytes,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: total_inodes,
                    available: free_inodes,
                    used: used_inodes,
                },
            ],
        })
    }

    pub async fn node_expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, Status> {
        let (volume_id, _) = extract_id_and_zone(&req.volume_id)
            .map_err(|err| Status::invalid_argument(format!("invalid parameter volumeID: {err}")))?;

        if req.volume_path.is_empty() {
            return Err(Status::invalid_argument("volumePath not provided"));
        }
        let volume_path = Path::new(&req.volume_path);

        let mut device_path =
            self.disk_utils
                .get_device_path(&volume_id)
                .map_err(|err| match err {
                    DiskError::DeviceNotFound(_) => {
                        Status::not_found(format!("volume {volume_id} is not mounted on node"))
                    }
                    other => Status::internal(format!(
                        "failed to get device path for volume {volume_id}: {other}"
                    )),
                })?;

        let mut is_block = self.disk_utils.is_block_device(volume_path).map_err(|err| {
            Status::internal(format!(
                "error checking stat for {}: {err}",
                device_path.display()
            ))
        })?;

        if let Some(capability) = req.volume_capability.as_ref() {
            let (block, _) = validate_volume_capability(capability).map_err(|err| {
                Status::invalid_argument(format!(
                    "volumeCapability not supported: {}",
                    err.message()
                ))
            })?;
            is_block = block;
        }

        // Raw block volumes have nothing to grow on the node.
        if is_block {
            return Ok(NodeExpandVolumeResponse::default());
        }

        debug!(%volume_id, volume_path = %volume_path.display(), "resizing volume");

        let encrypted = self
            .disk_utils
            .is_encrypted(&device_path)
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "error checking if volume {volume_id} is encrypted: {err}"
                ))
            })?;

        let passphrase = req
            .secrets
            .get(ENCRYPTION_PASSPHRASE_KEY)
            .filter(|passphrase| !passphrase.is_empty());

        if encrypted {
            device_path = self
                .disk_utils
                .get_mapped_device_path(&volume_id)
                .await
                .map_err(|err| {
                    Status::internal(format!(
                        "error retrieving mapped device path for volume with ID {volume_id}: {err}"
                    ))
                })?
                .ok_or_else(|| {
                    Status::internal(format!("encrypted volume with ID {volume_id} is not open"))
                })?;
            debug!(%volume_id, mapped = %device_path.display(), "volume is encrypted");

            if passphrase.is_none() {
                return Err(Status::invalid_argument(format!(
                    "device {} is LUKS encrypted, but no passphrase was provided",
                    device_path.display()
                )));
            }
        }

        self.disk_utils
            .resize(volume_path, &device_path, passphrase)
            .await
            .map_err(|err| {
                Status::internal(format!(
                    "failed to resize volume {volume_id} mounted on {}: {err}",
                    volume_path.display()
                ))
            })?;

        Ok(NodeExpandVolumeResponse::default())
    }

    pub async fn node_get_capabilities(
        &self,
        _req: NodeGetCapabilitiesRequest,
    ) -> Result<NodeGetCapabilitiesResponse, Status> {
        Ok(NodeGetCapabilitiesResponse {
            capabilities: NODE_CAPABILITIES.to_vec(),
        })
    }

    pub async fn node_get_info(
        &self,
        _req: NodeGetInfoRequest,
    ) -> Result<NodeGetInfoResponse, Status> {
        Ok(NodeGetInfoResponse {
            node_id: format!("{}/{}", self.node_zone, self.node_id),
            max_volumes_per_node: self.max_volumes_per_node,
            accessible_topology: Some(Topology {
                segments: std::collections::HashMap::from([(
                    ZONE_TOPOLOGY_KEY.to_owned(),
                    self.node_zone.to_string(),
                )]),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::csi::diskutils::FakeDiskUtils;
    use crate::csi::proto::{AccessMode, Code, Secrets, VolumeCapability};
    use crate::scaleway::{Api, Fake, Server, ServerVolume};

    struct Harness {
        cloud: Arc<Fake>,
        disk: Arc<FakeDiskUtils>,
        node: NodeService,
        server_id: String,
    }

    fn harness() -> Harness {
        let server_id = uuid::Uuid::new_v4().to_string();
        let server = Server {
            id: server_id.clone(),
            name: "node-1".to_owned(),
            zone: Zone::FrPar1,
            volumes: HashMap::from([(
                "0".to_owned(),
                ServerVolume {
                    id: uuid::Uuid::new_v4().to_string(),
                    volume_type: "l_ssd".to_owned(),
                    boot: Some(true),
                },
            )]),
        };
        let cloud = Arc::new(Fake::new(vec![server], None));
        let disk = Arc::new(FakeDiskUtils::new(Arc::clone(&cloud), &server_id));
        let node = NodeService::new(
            Arc::clone(&disk) as Arc<dyn DiskUtils>,
            &server_id,
            Zone::FrPar1,
            0,
        )
        .expect("node service");
        Harness {
            cloud,
            disk,
            node,
            server_id,
        }
    }

    /// Creates and attaches a volume, returning its ID and publish context.
    async fn attached_volume(h: &Harness, name: &str) -> (String, HashMap<String, String>) {
        let volume = h
            .cloud
            .create_volume(name, None, 10_000_000_000, None, None)
            .await
            .expect("create");
        h.cloud
            .attach_volume(&h.server_id, &volume.id, None)
            .await
            .expect("attach");

        let publish_context = HashMap::from([
            (PUBLISH_CONTEXT_VOLUME_ID_KEY.to_owned(), volume.id.clone()),
            (PUBLISH_CONTEXT_VOLUME_NAME_KEY.to_owned(), name.to_owned()),
            (
                util::PUBLISH_CONTEXT_VOLUME_ZONE_KEY.to_owned(),
                "fr-par-1".to_owned(),
            ),
        ]);
        (volume.id, publish_context)
    }

    fn stage_request(
        volume_id: &str,
        publish_context: &HashMap<String, String>,
        capability: VolumeCapability,
    ) -> NodeStageVolumeRequest {
        NodeStageVolumeRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            publish_context: publish_context.clone(),
            staging_target_path: format!("/staging/{volume_id}"),
            volume_capability: Some(capability),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn stage_xfs_always_mounts_with_nouuid() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-xfs").await;

        let req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("xfs", &[], AccessMode::SingleNodeWriter),
        );
        let staging = PathBuf::from(&req.staging_target_path);
        h.node.node_stage_volume(req).await.expect("stage");

        let options = h.disk.mount_options_at(&staging).expect("mounted");
        assert!(options.contains(&"nouuid".to_owned()));
        assert_eq!(h.disk.fs_type_at(&staging).as_deref(), Some("xfs"));
    }

    #[tokio::test]
    async fn stage_requires_capability_and_staging_path() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-args").await;

        let mut req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        req.staging_target_path = String::new();
        let err = h.node.node_stage_volume(req).await.expect_err("no staging");
        assert_eq!(err.code(), Code::InvalidArgument);

        let mut req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        req.volume_capability = None;
        let err = h
            .node
            .node_stage_volume(req)
            .await
            .expect_err("no capability");
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn stage_unknown_device_is_not_found() {
        let h = harness();
        let ghost = uuid::Uuid::new_v4().to_string();
        let ctx = HashMap::from([
            (PUBLISH_CONTEXT_VOLUME_ID_KEY.to_owned(), ghost.clone()),
            (
                PUBLISH_CONTEXT_VOLUME_NAME_KEY.to_owned(),
                "ghost".to_owned(),
            ),
        ]);
        let req = stage_request(
            &ghost,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        let err = h
            .node
            .node_stage_volume(req)
            .await
            .expect_err("not attached");
        assert_eq!(err.code(), Code::NotFound);
    }

    #[tokio::test]
    async fn stage_encrypted_requires_passphrase() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-crypt").await;

        let mut req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        req.volume_context = HashMap::from([("encrypted".to_owned(), "true".to_owned())]);

        let err = h
            .node
            .node_stage_volume(req.clone())
            .await
            .expect_err("missing passphrase");
        assert_eq!(err.code(), Code::InvalidArgument);

        req.secrets = Secrets(HashMap::from([(
            ENCRYPTION_PASSPHRASE_KEY.to_owned(),
            "passphrase".to_owned(),
        )]));
        h.node.node_stage_volume(req).await.expect("stage encrypted");

        let mapped = h
            .disk
            .get_mapped_device_path(&volume_id)
            .await
            .expect("mapped lookup");
        assert!(mapped.is_some(), "LUKS device must be open after staging");
    }

    #[tokio::test]
    async fn stage_block_capability_skips_mount() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-block").await;

        let req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::block(AccessMode::SingleNodeWriter),
        );
        let staging = PathBuf::from(&req.staging_target_path);
        h.node.node_stage_volume(req).await.expect("stage block");
        assert!(!h.disk.is_mounted(&staging));
    }

    #[tokio::test]
    async fn stage_is_idempotent() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-idem").await;

        let req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        h.node.node_stage_volume(req.clone()).await.expect("first");
        h.node.node_stage_volume(req).await.expect("second");
    }

    #[tokio::test]
    async fn unstage_unmounts_and_closes() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-unstage").await;

        let req = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        let staging = req.staging_target_path.clone();
        h.node.node_stage_volume(req).await.expect("stage");

        let unstage = NodeUnstageVolumeRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            staging_target_path: staging.clone(),
        };
        h.node
            .node_unstage_volume(unstage.clone())
            .await
            .expect("unstage");
        assert!(!h.disk.is_mounted(Path::new(&staging)));

        // Repeated calls are fine.
        h.node
            .node_unstage_volume(unstage)
            .await
            .expect("unstage again");
    }

    #[tokio::test]
    async fn publish_type_change_is_already_exists() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-pub").await;

        let stage = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        let staging = stage.staging_target_path.clone();
        h.node.node_stage_volume(stage).await.expect("stage");

        let workdir = tempfile::tempdir().expect("tempdir");
        let target = workdir.path().join("published");
        let publish = NodePublishVolumeRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            publish_context: ctx.clone(),
            staging_target_path: staging.clone(),
            target_path: target.display().to_string(),
            volume_capability: Some(VolumeCapability::mount(
                "ext4",
                &[],
                AccessMode::SingleNodeWriter,
            )),
            ..Default::default()
        };
        h.node
            .node_publish_volume(publish.clone())
            .await
            .expect("publish");

        // Re-publishing with the same type is idempotent.
        h.node
            .node_publish_volume(publish.clone())
            .await
            .expect("publish again");

        // Publishing the same target as block must be refused.
        let mut as_block = publish;
        as_block.volume_capability = Some(VolumeCapability::block(AccessMode::SingleNodeWriter));
        let err = h
            .node
            .node_publish_volume(as_block)
            .await
            .expect_err("type change");
        assert_eq!(err.code(), Code::AlreadyExists);
    }

    #[tokio::test]
    async fn unpublish_not_mounted_is_success() {
        let h = harness();
        let req = NodeUnpublishVolumeRequest {
            volume_id: "fr-par-1/11111111-1111-1111-1111-111111111111".to_owned(),
            target_path: "/published/nothing-here".to_owned(),
        };
        h.node.node_unpublish_volume(req).await.expect("no-op");
    }

    #[tokio::test]
    async fn volume_stats_require_a_mount() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-stats").await;

        let stats_req = NodeGetVolumeStatsRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            volume_path: format!("/staging/{volume_id}"),
            ..Default::default()
        };
        let err = h
            .node
            .node_get_volume_stats(stats_req.clone())
            .await
            .expect_err("not mounted");
        assert_eq!(err.code(), Code::NotFound);

        let stage = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter),
        );
        h.node.node_stage_volume(stage).await.expect("stage");

        let stats = h.node.node_get_volume_stats(stats_req).await.expect("stats");
        assert_eq!(stats.usage.len(), 2);
        assert_eq!(stats.usage[0].unit, UsageUnit::Bytes);
        assert_eq!(stats.usage[0].total, 1000 * 4096);
        assert_eq!(stats.usage[0].used, 500 * 4096);
        assert_eq!(stats.usage[1].unit, UsageUnit::Inodes);
        assert_eq!(stats.usage[1].total, 1000);
    }

    #[tokio::test]
    async fn expand_block_volume_is_a_no_op() {
        let h = harness();
        let (volume_id, ctx) = attached_volume(&h, "vol-expand").await;

        let stage = stage_request(
            &volume_id,
            &ctx,
            VolumeCapability::block(AccessMode::SingleNodeWriter),
        );
        let staging = stage.staging_target_path.clone();
        h.node.node_stage_volume(stage).await.expect("stage");

        let workdir = tempfile::tempdir().expect("tempdir");
        let target = workdir.path().join("block-volume");
        let publish = NodePublishVolumeRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            publish_context: ctx.clone(),
            staging_target_path: staging,
            target_path: target.display().to_string(),
            volume_capability: Some(VolumeCapability::block(AccessMode::SingleNodeWriter)),
            ..Default::default()
        };
        h.node.node_publish_volume(publish).await.expect("publish");

        let req = NodeExpandVolumeRequest {
            volume_id: format!("fr-par-1/{volume_id}"),
            volume_path: target.display().to_string(),
            volume_capability: Some(VolumeCapability::block(AccessMode::SingleNodeWriter)),
            ..Default::default()
        };
        h.node
            .node_expand_volume(req)
            .await
            .expect("block expand no-op");
    }

    #[tokio::test]
    async fn node_info_reports_zonal_id_and_max_volumes() {
        let h = harness();
        let info = h
            .node
            .node_get_info(NodeGetInfoRequest {})
            .await
            .expect("info");
        assert_eq!(info.node_id, format!("fr-par-1/{}", h.server_id));
        assert_eq!(info.max_volumes_per_node, 15);
        assert_eq!(
            info.accessible_topology
                .expect("topology")
                .segments
                .get(ZONE_TOPOLOGY_KEY),
            Some(&"fr-par-1".to_owned())
        );

        let caps = h
            .node
            .node_get_capabilities(NodeGetCapabilitiesRequest {})
            .await
            .expect("capabilities");
        assert!(caps
            .capabilities
            .contains(&NodeCapability::StageUnstageVolume));
    }
}
