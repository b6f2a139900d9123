//! Volume and snapshot operations against the Block Storage API, including
//! the wait-for-state loops.

use tokio::time::{sleep, Instant};
use tracing::debug;

use super::errors::Error;
use super::helpers::{check_uuid, paginated_list, MAX_PAGE_SIZE};
use super::types::{
    CreateSnapshotBody, CreateVolumeBody, CreateVolumeFromEmpty, CreateVolumeFromSnapshot,
    ListSnapshotsResponse, ListVolumesResponse, ReferenceStatus, Snapshot, UpdateVolumeBody,
    Volume, VolumeStatus, Zone,
};
use super::{
    Client, INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE, SNAPSHOT_RESOURCE, VOLUME_RESOURCE,
    WAIT_POLL_INTERVAL, WAIT_TIMEOUT,
};

impl Client {
    fn volumes_path(zone: Zone) -> String {
        format!("/block/v1/zones/{zone}/volumes")
    }

    fn snapshots_path(zone: Zone) -> String {
        format!("/block/v1/zones/{zone}/snapshots")
    }

    pub(crate) async fn do_get_volume(&self, volume_id: &str, zone: Zone) -> Result<Volume, Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        self.get_json(
            &format!("{}/{volume_id}", Self::volumes_path(zone)),
            &[],
            VOLUME_RESOURCE,
            volume_id,
        )
        .await
    }

    pub(crate) async fn do_get_snapshot(
        &self,
        snapshot_id: &str,
        zone: Zone,
    ) -> Result<Snapshot, Error> {
        check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
        self.get_json(
            &format!("{}/{snapshot_id}", Self::snapshots_path(zone)),
            &[],
            SNAPSHOT_RESOURCE,
            snapshot_id,
        )
        .await
    }

    /// Lists every volume of the zone whose name matches the filter.
    async fn list_zone_volumes(
        &self,
        zone: Zone,
        name: Option<&str>,
        page: i32,
        page_size: u32,
    ) -> Result<Vec<Volume>, Error> {
        let mut query = vec![
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(name) = name {
            query.push(("name", name.to_owned()));
        }
        let resp: ListVolumesResponse = self
            .get_json(&Self::volumes_path(zone), &query, VOLUME_RESOURCE, "")
            .await?;
        Ok(resp.volumes)
    }

    async fn list_zone_snapshots(
        &self,
        zone: Zone,
        name: Option<&str>,
        volume_id: Option<&str>,
        page: i32,
        page_size: u32,
    ) -> Result<Vec<Snapshot>, Error> {
        let mut query = vec![
            ("page", page.to_string()),
            ("page_size", page_size.to_string()),
        ];
        if let Some(name) = name {
            query.push(("name", name.to_owned()));
        }
        if let Some(volume_id) = volume_id {
            query.push(("volume_id", volume_id.to_owned()));
        }
        let resp: ListSnapshotsResponse = self
            .get_json(&Self::snapshots_path(zone), &query, SNAPSHOT_RESOURCE, "")
            .await?;
        Ok(resp.snapshots)
    }

    /// Finds a volume by its exact name in the provided zone.
    pub(crate) async fn do_get_volume_by_name(
        &self,
        name: &str,
        size: u64,
        zone: Zone,
    ) -> Result<Volume, Error> {
        let mut page = 1;
        loop {
            let volumes = self
                .list_zone_volumes(zone, Some(name), page, MAX_PAGE_SIZE)
                .await?;
            let count = volumes.len();

            for volume in volumes {
                if volume.name == name {
                    if volume.size != size {
                        return Err(Error::VolumeDifferentSize { id: volume.id });
                    }
                    return Ok(volume);
                }
            }

            if count < MAX_PAGE_SIZE as usize {
                return Err(Error::VolumeNotFound);
            }
            page += 1;
        }
    }

    /// Finds a snapshot by its exact name and source volume in the provided
    /// zone.
    pub(crate) async fn do_get_snapshot_by_name(
        &self,
        name: &str,
        source_volume_id: &str,
        zone: Zone,
    ) -> Result<Snapshot, Error> {
        let mut page = 1;
        loop {
            let snapshots = self
                .list_zone_snapshots(zone, Some(name), None, page, MAX_PAGE_SIZE)
                .await?;
            let count = snapshots.len();

            for snapshot in snapshots {
                if snapshot.name == name {
                    if snapshot
                        .parent_volume
                        .as_ref()
                        .is_some_and(|parent| parent.id != source_volume_id)
                    {
                        return Err(Error::SnapshotExists);
                    }
                    return Ok(snapshot);
                }
            }

            if count < MAX_PAGE_SIZE as usize {
                return Err(Error::SnapshotNotFound);
            }
            page += 1;
        }
    }

    pub(crate) async fn do_list_volumes(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Volume>, Option<String>), Error> {
        let zones: Vec<Zone> = self.zones().to_vec();
        paginated_list(
            |page, page_size| {
                let zones = zones.clone();
                async move {
                    let mut merged = Vec::new();
                    for zone in zones {
                        merged.extend(
                            self.list_zone_volumes(zone, None, page, page_size).await?,
                        );
                    }
                    Ok(merged)
                }
            },
            start,
            max,
        )
        .await
    }

    pub(crate) async fn do_list_snapshots(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        let zones: Vec<Zone> = self.zones().to_vec();
        paginated_list(
            |page, page_size| {
                let zones = zones.clone();
                async move {
                    let mut merged = Vec::new();
                    for zone in zones {
                        merged.extend(
                            self.list_zone_snapshots(zone, None, None, page, page_size)
                                .await?,
                        );
                    }
                    Ok(merged)
                }
            },
            start,
            max,
        )
        .await
    }

    pub(crate) async fn do_list_snapshots_by_source_volume(
        &self,
        start: u32,
        max: u32,
        source_volume_id: &str,
        source_volume_zone: Zone,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        // Return nothing for IDs that are not well-formed UUIDs.
        if check_uuid(source_volume_id, VOLUME_RESOURCE).is_err() {
            return Ok((Vec::new(), None));
        }

        paginated_list(
            |page, page_size| async move {
                self.list_zone_snapshots(
                    source_volume_zone,
                    None,
                    Some(source_volume_id),
                    page,
                    page_size,
                )
                .await
            },
            start,
            max,
        )
        .await
    }

    pub(crate) async fn do_delete_volume(&self, volume_id: &str, zone: Zone) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        self.delete(
            &format!("{}/{volume_id}", Self::volumes_path(zone)),
            VOLUME_RESOURCE,
            volume_id,
        )
        .await
    }

    pub(crate) async fn do_delete_snapshot(
        &self,
        snapshot_id: &str,
        zone: Zone,
    ) -> Result<(), Error> {
        check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
        self.delete(
            &format!("{}/{snapshot_id}", Self::snapshots_path(zone)),
            SNAPSHOT_RESOURCE,
            snapshot_id,
        )
        .await
    }

    pub(crate) async fn do_create_volume(
        &self,
        name: &str,
        snapshot_id: Option<&str>,
        size: u64,
        perf_iops: Option<u32>,
        zone: Zone,
    ) -> Result<Volume, Error> {
        let mut body = CreateVolumeBody {
            name: name.to_owned(),
            project_id: self.project_id().to_owned(),
            perf_iops,
            from_empty: None,
            from_snapshot: None,
        };

        match snapshot_id {
            Some(snapshot_id) => {
                check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
                body.from_snapshot = Some(CreateVolumeFromSnapshot {
                    snapshot_id: snapshot_id.to_owned(),
                    size: Some(size),
                });
            }
            None => {
                body.from_empty = Some(CreateVolumeFromEmpty { size });
            }
        }

        let volume: Volume = self
            .post_json(&Self::volumes_path(zone), &body, VOLUME_RESOURCE, name)
            .await?;

        let volume = self.wait_for_volume(&volume.id, zone).await?;
        if volume.status != VolumeStatus::Available {
            return Err(Error::UnexpectedVolumeStatus {
                id: volume.id,
                status: volume.status,
            });
        }

        Ok(volume)
    }

    pub(crate) async fn do_resize_volume(
        &self,
        volume_id: &str,
        zone: Zone,
        size: u64,
    ) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;

        let _: Volume = self
            .patch_json(
                &format!("{}/{volume_id}", Self::volumes_path(zone)),
                &UpdateVolumeBody { size: Some(size) },
                VOLUME_RESOURCE,
                volume_id,
            )
            .await?;

        let volume = self.wait_for_volume(volume_id, zone).await?;
        if volume.status != VolumeStatus::Available && volume.status != VolumeStatus::InUse {
            return Err(Error::UnexpectedVolumeStatus {
                id: volume.id,
                status: volume.status,
            });
        }

        Ok(())
    }

    pub(crate) async fn do_create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        zone: Zone,
    ) -> Result<Snapshot, Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        self.post_json(
            &Self::snapshots_path(zone),
            &CreateSnapshotBody {
                name: name.to_owned(),
                volume_id: volume_id.to_owned(),
                project_id: self.project_id().to_owned(),
            },
            SNAPSHOT_RESOURCE,
            name,
        )
        .await
    }

    /// Polls the snapshot until it reaches a terminal status.
    pub(crate) async fn do_wait_for_snapshot(
        &self,
        snapshot_id: &str,
        zone: Zone,
    ) -> Result<Snapshot, Error> {
        check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;

        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let snapshot = self.do_get_snapshot(snapshot_id, zone).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }

            debug!(
                snapshot_id,
                status = %snapshot.status,
                "waiting for snapshot to reach a terminal status"
            );

            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout {
                    resource: SNAPSHOT_RESOURCE,
                    id: snapshot_id.to_owned(),
                });
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Polls the volume until it reaches a terminal status.
    pub(crate) async fn wait_for_volume(&self, volume_id: &str, zone: Zone) -> Result<Volume, Error> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let volume = self.do_get_volume(volume_id, zone).await?;
            if volume.status.is_terminal() {
                return Ok(volume);
            }

            debug!(
                volume_id,
                status = %volume.status,
                "waiting for volume to reach a terminal status"
            );

            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout {
                    resource: VOLUME_RESOURCE,
                    id: volume_id.to_owned(),
                });
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Polls the volume until it has the wanted status and every
    /// `instance_server` reference has the wanted reference status. Used
    /// after attach and detach, where both the volume and the reference
    /// transition asynchronously.
    pub(crate) async fn wait_for_volume_and_references(
        &self,
        volume_id: &str,
        zone: Zone,
        volume_status: VolumeStatus,
        reference_status: ReferenceStatus,
    ) -> Result<Volume, Error> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            let volume = self.do_get_volume(volume_id, zone).await?;

            if volume.status == VolumeStatus::Error {
                return Err(Error::UnexpectedVolumeStatus {
                    id: volume.id,
                    status: volume.status,
                });
            }

            let references_settled = volume
                .references
                .iter()
                .filter(|r| r.product_resource_type == INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE)
                .all(|r| r.status == reference_status);

            if volume.status == volume_status && references_settled {
                return Ok(volume);
            }

            debug!(
                volume_id,
                status = %volume.status,
                wanted = %volume_status,
                "waiting for volume and references"
            );

            if Instant::now() >= deadline {
                return Err(Error::WaitTimeout {
                    resource: VOLUME_RESOURCE,
                    id: volume_id.to_owned(),
                });
            }
            sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}
