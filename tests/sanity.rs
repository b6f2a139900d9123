//! End-to-end scenarios running the controller and node services against
//! the in-memory Scaleway fake and fake disk utilities, the same wiring the
//! driver has in production minus the cloud and the kernel.

use std::collections::HashMap;
use std::sync::Arc;

use scaleway_csi::csi::controller::ControllerService;
use scaleway_csi::csi::diskutils::{DiskUtils, FakeDiskUtils};
use scaleway_csi::csi::node::NodeService;
use scaleway_csi::csi::proto::{
    AccessMode, CapacityRange, Code, ControllerExpandVolumeRequest, ControllerPublishVolumeRequest,
    ControllerUnpublishVolumeRequest, CreateVolumeRequest, DeleteVolumeRequest,
    ListVolumesRequest, NodeExpandVolumeRequest, NodePublishVolumeRequest, NodeStageVolumeRequest,
    NodeUnpublishVolumeRequest, NodeUnstageVolumeRequest, Topology, TopologyRequirement,
    VolumeCapability, VolumeContentSource,
};
use scaleway_csi::csi::util::ZONE_TOPOLOGY_KEY;
use scaleway_csi::scaleway::{Api, Fake, Server, ServerVolume, Zone};

const GB: i64 = 1_000_000_000;

struct Sanity {
    cloud: Arc<Fake>,
    controller: ControllerService,
    node: NodeService,
    node_id: String,
}

fn sanity() -> Sanity {
    let node_id = uuid::Uuid::new_v4().to_string();
    let server = Server {
        id: node_id.clone(),
        name: "sanity-node".to_owned(),
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

    let cloud = Arc::new(Fake::new(vec![server], Some(Zone::FrPar1)));
    let controller = ControllerService::with_client(Arc::clone(&cloud) as Arc<dyn Api>, "");
    let disk = Arc::new(FakeDiskUtils::new(Arc::clone(&cloud), &node_id));
    let node = NodeService::new(disk as Arc<dyn DiskUtils>, &node_id, Zone::FrPar1, 0)
        .expect("node service");

    Sanity {
        cloud,
        controller,
        node,
        node_id,
    }
}

fn zone_topology(zone: &str) -> TopologyRequirement {
    TopologyRequirement {
        requisite: vec![Topology {
            segments: HashMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), zone.to_owned())]),
        }],
        preferred: vec![Topology {
            segments: HashMap::from([(ZONE_TOPOLOGY_KEY.to_owned(), zone.to_owned())]),
        }],
    }
}

fn mount_capability() -> VolumeCapability {
    VolumeCapability::mount("ext4", &[], AccessMode::SingleNodeWriter)
}

/// Scenario: the full lifecycle of a volume. Create a 10 GB volume in
/// fr-par-1, attach it to the node, stage it as ext4, publish it, write some
/// data, then tear everything down and check the volume is gone.
#[tokio::test]
async fn volume_full_lifecycle() {
    let s = sanity();

    let created = s
        .controller
        .create_volume(CreateVolumeRequest {
            name: "lifecycle".to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 10 * GB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability()],
            accessibility_requirements: Some(zone_topology("fr-par-1")),
            ..Default::default()
        })
        .await
        .expect("create volume");

    let volume_id = created.volume.volume_id.clone();
    assert!(volume_id.starts_with("fr-par-1/"));
    assert_eq!(created.volume.capacity_bytes, 10 * GB);

    // Attach.
    let published = s
        .controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: format!("fr-par-1/{}", s.node_id),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("controller publish");

    // Stage.
    let staging_target_path = format!("/staging/{}", created.volume.volume_id);
    s.node
        .node_stage_volume(NodeStageVolumeRequest {
            volume_id: volume_id.clone(),
            publish_context: published.publish_context.clone(),
            staging_target_path: staging_target_path.clone(),
            volume_capability: Some(mount_capability()),
            volume_context: created.volume.volume_context.clone(),
            ..Default::default()
        })
        .await
        .expect("stage");

    // Publish and write some data through the published path.
    let workdir = tempfile::tempdir().expect("tempdir");
    let target_path = workdir.path().join("var/lib/x");
    s.node
        .node_publish_volume(NodePublishVolumeRequest {
            volume_id: volume_id.clone(),
            publish_context: published.publish_context.clone(),
            staging_target_path: staging_target_path.clone(),
            target_path: target_path.display().to_string(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("node publish");

    assert!(target_path.is_dir());
    std::fs::write(target_path.join("data.bin"), vec![0_u8; 1024 * 1024])
        .expect("write 1 MB of data");

    // Tear down.
    s.node
        .node_unpublish_volume(NodeUnpublishVolumeRequest {
            volume_id: volume_id.clone(),
            target_path: target_path.display().to_string(),
        })
        .await
        .expect("node unpublish");

    s.node
        .node_unstage_volume(NodeUnstageVolumeRequest {
            volume_id: volume_id.clone(),
            staging_target_path,
        })
        .await
        .expect("unstage");

    s.controller
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: format!("fr-par-1/{}", s.node_id),
            ..Default::default()
        })
        .await
        .expect("controller unpublish");

    s.controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: volume_id.clone(),
            ..Default::default()
        })
        .await
        .expect("delete");

    let listed = s
        .controller
        .list_volumes(ListVolumesRequest::default())
        .await
        .expect("list");
    assert!(
        listed
            .entries
            .iter()
            .all(|entry| entry.volume.volume_id != volume_id),
        "deleted volume must not be listed"
    );
}

/// Scenario: provisioning from a snapshot whose zone is incompatible with
/// the requested topology fails with ResourceExhausted.
#[tokio::test]
async fn create_from_snapshot_in_other_zone_is_exhausted() {
    let s = sanity();

    let source = s
        .cloud
        .create_volume("source", None, 10 * GB as u64, None, Some(Zone::FrPar1))
        .await
        .expect("source volume");
    let snapshot = s
        .cloud
        .create_snapshot("snap", &source.id, Some(Zone::FrPar1))
        .await
        .expect("snapshot");

    let err = s
        .controller
        .create_volume(CreateVolumeRequest {
            name: "restored".to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 10 * GB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability()],
            volume_content_source: Some(VolumeContentSource::Snapshot {
                snapshot_id: format!("fr-par-1/{}", snapshot.id),
            }),
            accessibility_requirements: Some(zone_topology("fr-par-2")),
            ..Default::default()
        })
        .await
        .expect_err("snapshot zone is outside the topology");
    assert_eq!(err.code(), Code::ResourceExhausted);
}

/// Scenario: two racing CreateVolume calls with the same name and size both
/// succeed with the same volume ID.
#[tokio::test]
async fn racing_creates_return_the_same_volume() {
    let s = sanity();
    let controller = Arc::new(s.controller);

    let request = CreateVolumeRequest {
        name: "foo".to_owned(),
        capacity_range: Some(CapacityRange {
            required_bytes: 10 * GB,
            limit_bytes: 0,
        }),
        volume_capabilities: vec![mount_capability()],
        ..Default::default()
    };

    let first = {
        let controller = Arc::clone(&controller);
        let request = request.clone();
        tokio::spawn(async move { controller.create_volume(request).await })
    };
    let second = {
        let controller = Arc::clone(&controller);
        let request = request.clone();
        tokio::spawn(async move { controller.create_volume(request).await })
    };

    let first = first.await.expect("join").expect("first create");
    let second = second.await.expect("join").expect("second create");
    assert_eq!(first.volume.volume_id, second.volume.volume_id);
    assert_eq!(first.volume.capacity_bytes, second.volume.capacity_bytes);
}

/// Scenario: attaching a seventeenth volume to a node that already hosts
/// sixteen fails with ResourceExhausted.
#[tokio::test]
async fn seventeenth_volume_is_resource_exhausted() {
    let s = sanity();

    let mut last_volume_id = String::new();
    for i in 0..16 {
        let created = s
            .controller
            .create_volume(CreateVolumeRequest {
                name: format!("bulk-{i}"),
                capacity_range: Some(CapacityRange {
                    required_bytes: GB,
                    limit_bytes: 0,
                }),
                volume_capabilities: vec![mount_capability()],
                ..Default::default()
            })
            .await
            .expect("create");
        last_volume_id = created.volume.volume_id.clone();

        let publish = s
            .controller
            .controller_publish_volume(ControllerPublishVolumeRequest {
                volume_id: created.volume.volume_id.clone(),
                node_id: format!("fr-par-1/{}", s.node_id),
                volume_capability: Some(mount_capability()),
                ..Default::default()
            })
            .await;

        if i < 15 {
            publish.expect("the node has free slots");
        } else {
            // Slot 16 would be the seventeenth volume, root included.
            let err = publish.expect_err("the node is full");
            assert_eq!(err.code(), Code::ResourceExhausted);
        }
    }

    // Publishing the last volume after freeing a slot succeeds.
    let first_listed = s
        .cloud
        .list_volumes(0, 0)
        .await
        .expect("list")
        .0
        .into_iter()
        .find(|volume| !volume.references.is_empty())
        .expect("an attached volume");
    s.controller
        .controller_unpublish_volume(ControllerUnpublishVolumeRequest {
            volume_id: format!("fr-par-1/{}", first_listed.id),
            node_id: format!("fr-par-1/{}", s.node_id),
            ..Default::default()
        })
        .await
        .expect("free a slot");

    s.controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: last_volume_id,
            node_id: format!("fr-par-1/{}", s.node_id),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("a slot is free again");
}

/// Scenario: growing a staged ext4 volume from 10 to 20 GB. The controller
/// reports that node expansion is required, and the node grows the
/// filesystem in place.
#[tokio::test]
async fn online_expansion_grows_the_filesystem() {
    let s = sanity();

    let created = s
        .controller
        .create_volume(CreateVolumeRequest {
            name: "grow-me".to_owned(),
            capacity_range: Some(CapacityRange {
                required_bytes: 10 * GB,
                limit_bytes: 0,
            }),
            volume_capabilities: vec![mount_capability()],
            ..Default::default()
        })
        .await
        .expect("create");
    let volume_id = created.volume.volume_id.clone();

    let published = s
        .controller
        .controller_publish_volume(ControllerPublishVolumeRequest {
            volume_id: volume_id.clone(),
            node_id: format!("fr-par-1/{}", s.node_id),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("publish");

    let staging_target_path = format!("/staging/{volume_id}");
    s.node
        .node_stage_volume(NodeStageVolumeRequest {
            volume_id: volume_id.clone(),
            publish_context: published.publish_context.clone(),
            staging_target_path: staging_target_path.clone(),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("stage");

    let expanded = s
        .controller
        .controller_expand_volume(ControllerExpandVolumeRequest {
            volume_id: volume_id.clone(),
            capacity_range: Some(CapacityRange {
                required_bytes: 20 * GB,
                limit_bytes: 0,
            }),
            volume_capability: Some(mount_capability()),
            ..Default::default()
        })
        .await
        .expect("controller expand");
    assert_eq!(expanded.capacity_bytes, 20 * GB);
    assert!(expanded.node_expansion_required);

    s.node
        .node_expand_volume(NodeExpandVolumeRequest {
            volume_id: volume_id.clone(),
            volume_path: staging_target_path,
            capacity_range: Some(CapacityRange {
                required_bytes: 20 * GB,
                limit_bytes: 0,
            }),
            ..Default::default()
        })
        .await
        .expect("node expand");

    let (_, raw_id) = volume_id.split_once('/').expect("zonal id");
    let grown = s.cloud.get_volume(raw_id, None).await.expect("get volume");
    assert_eq!(grown.size, 20 * GB as u64);
}

/// Scenario: deleting a volume whose ID is not a UUID succeeds without any
/// API side effect, the pre-check synthesizes not-found.
#[tokio::test]
async fn delete_with_malformed_id_is_a_success() {
    let s = sanity();

    s.cloud
        .create_volume("survivor", None, GB as u64, None, None)
        .await
        .expect("create");

    s.controller
        .delete_volume(DeleteVolumeRequest {
            volume_id: "not-even-close-to-a-uuid".to_owned(),
            ..Default::default()
        })
        .await
        .expect("malformed id deletes nothing and succeeds");

    assert_eq!(s.cloud.volume_count(), 1, "no volume may be deleted");
}
