//! In-memory fake of the Scaleway client.
//!
//! The fake enforces the same preconditions as the real APIs (slot
//! allocation, reference transitions, zone-scoped lookups, not-found on
//! unknown UUIDs), so that the sanity suite exercises the same failure
//! paths as a real deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use super::errors::Error;
use super::helpers::check_uuid;
use super::types::{
    Reference, ReferenceStatus, Server, ServerVolume, Snapshot, SnapshotParentVolume,
    SnapshotStatus, Volume, VolumeSpecifications, VolumeStatus, Zone,
};
use super::{
    Api, INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE, MAX_VOLUMES_PER_NODE, SERVER_RESOURCE,
    SNAPSHOT_RESOURCE, VOLUME_RESOURCE,
};

/// `volume_type` assigned to fake attachments.
const SBS_VOLUME_TYPE: &str = "sbs_volume";

#[derive(Default)]
struct State {
    volumes: HashMap<String, Volume>,
    snapshots: HashMap<String, Snapshot>,
    servers: HashMap<String, Server>,
}

/// Fake Scaleway client storing volumes, snapshots and servers in memory.
pub struct Fake {
    state: Mutex<State>,
    default_zone: Zone,
}

impl Fake {
    /// Creates a fake client pre-populated with the given servers.
    pub fn new(servers: Vec<Server>, default_zone: Option<Zone>) -> Self {
        let mut state = State::default();
        for server in servers {
            state.servers.insert(server.id.clone(), server);
        }
        Self {
            state: Mutex::new(state),
            default_zone: default_zone.unwrap_or(Zone::FrPar1),
        }
    }

    fn zone_or_default(&self, zone: Option<Zone>) -> Zone {
        zone.unwrap_or(self.default_zone)
    }

    /// Snapshot of the server as currently stored, for tests that need to
    /// inspect slot assignments.
    pub fn server(&self, server_id: &str) -> Option<Server> {
        self.state.lock().servers.get(server_id).cloned()
    }

    /// Number of volumes currently stored, across all zones.
    pub fn volume_count(&self) -> usize {
        self.state.lock().volumes.len()
    }

    fn paginate<T: Clone>(
        mut items: Vec<(String, T)>,
        start: u32,
        max: u32,
    ) -> (Vec<T>, Option<String>) {
        items.sort_by(|a, b| a.0.cmp(&b.0));
        let total = items.len();
        let start = start as usize;
        if start >= total {
            return (Vec::new(), None);
        }

        let end = if max == 0 {
            total
        } else {
            (start + max as usize).min(total)
        };
        let page = items[start..end].iter().map(|(_, v)| v.clone()).collect();
        let next = (end < total).then(|| end.to_string());
        (page, next)
    }
}

#[async_trait]
impl Api for Fake {
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<(), Error> {
        check_uuid(server_id, SERVER_RESOURCE)?;
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let server_zone = state.servers.get(server_id).map(|s| s.zone);
        if server_zone != Some(zone) {
            return Err(Error::NotFound {
                resource: SERVER_RESOURCE,
                id: server_id.to_owned(),
            });
        }

        let volume = state.volumes.get(volume_id).filter(|v| v.zone == zone);
        match volume {
            None => {
                return Err(Error::NotFound {
                    resource: VOLUME_RESOURCE,
                    id: volume_id.to_owned(),
                })
            }
            Some(volume) if volume.status != VolumeStatus::Available => {
                return Err(Error::PreconditionFailed {
                    message: format!("volume is not available, it is {}", volume.status),
                })
            }
            Some(_) => {}
        }

        let server = state
            .servers
            .get_mut(server_id)
            .unwrap_or_else(|| unreachable!("server presence checked above"));
        if server.volumes.len() >= MAX_VOLUMES_PER_NODE {
            return Err(Error::MaxVolumesReached {
                id: server_id.to_owned(),
            });
        }

        // First free slot, "0" being the root volume.
        let slot = (0..=server.volumes.len())
            .map(|i| i.to_string())
            .find(|key| !server.volumes.contains_key(key))
            .unwrap_or_else(|| unreachable!("a free slot always exists below capacity"));
        server.volumes.insert(
            slot,
            ServerVolume {
                id: volume_id.to_owned(),
                volume_type: SBS_VOLUME_TYPE.to_owned(),
                boot: None,
            },
        );

        let volume = state
            .volumes
            .get_mut(volume_id)
            .unwrap_or_else(|| unreachable!("volume presence checked above"));
        volume.references.push(Reference {
            id: Uuid::new_v4().to_string(),
            product_resource_type: INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE.to_owned(),
            product_resource_id: server_id.to_owned(),
            status: ReferenceStatus::Attached,
        });
        volume.status = VolumeStatus::InUse;

        Ok(())
    }

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let volume = state
            .volumes
            .get(volume_id)
            .filter(|v| v.zone == zone)
            .ok_or(Error::NotFound {
                resource: VOLUME_RESOURCE,
                id: volume_id.to_owned(),
            })?;

        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            zone,
            size: volume.size,
            status: SnapshotStatus::Available,
            parent_volume: Some(SnapshotParentVolume {
                id: volume.id.clone(),
                name: volume.name.clone(),
            }),
            created_at: Some(Utc::now()),
        };
        state
            .snapshots
            .insert(snapshot.id.clone(), snapshot.clone());

        Ok(snapshot)
    }

    async fn create_volume(
        &self,
        name: &str,
        snapshot_id: Option<&str>,
        size: u64,
        perf_iops: Option<u32>,
        zone: Option<Zone>,
    ) -> Result<Volume, Error> {
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        // Volume names are unique per zone and project; a concurrent create
        // with the same name converges on the existing volume.
        if let Some(existing) = state
            .volumes
            .values()
            .find(|v| v.name == name && v.zone == zone)
        {
            return Ok(existing.clone());
        }

        let mut volume = Volume {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            zone,
            size,
            status: VolumeStatus::Available,
            parent_snapshot_id: None,
            references: Vec::new(),
            specs: Some(VolumeSpecifications {
                perf_iops: Some(perf_iops.unwrap_or(5000)),
                class: "sbs".to_owned(),
            }),
            created_at: Some(Utc::now()),
        };

        if let Some(snapshot_id) = snapshot_id {
            check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
            let snapshot = state
                .snapshots
                .get(snapshot_id)
                .filter(|s| s.zone == zone)
                .ok_or(Error::NotFound {
                    resource: SNAPSHOT_RESOURCE,
                    id: snapshot_id.to_owned(),
                })?;

            volume.parent_snapshot_id = Some(snapshot_id.to_owned());
            // The restored volume is never smaller than the snapshot.
            volume.size = size.max(snapshot.size);
        }

        state.volumes.insert(volume.id.clone(), volume.clone());

        Ok(volume)
    }

    async fn delete_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let exists = state
            .snapshots
            .get(snapshot_id)
            .is_some_and(|s| s.zone == zone);
        if !exists {
            return Err(Error::NotFound {
                resource: SNAPSHOT_RESOURCE,
                id: snapshot_id.to_owned(),
            });
        }

        state.snapshots.remove(snapshot_id);
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let volume = state
            .volumes
            .get(volume_id)
            .filter(|v| v.zone == zone)
            .ok_or(Error::NotFound {
                resource: VOLUME_RESOURCE,
                id: volume_id.to_owned(),
            })?;

        if !volume.references.is_empty() {
            return Err(Error::PreconditionFailed {
                message: format!("volume {volume_id} still has references"),
            });
        }

        state.volumes.remove(volume_id);
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let volume = state
            .volumes
            .get(volume_id)
            .filter(|v| v.zone == zone)
            .ok_or(Error::NotFound {
                resource: VOLUME_RESOURCE,
                id: volume_id.to_owned(),
            })?;

        if volume.status != VolumeStatus::InUse || volume.references.is_empty() {
            return Err(Error::PreconditionFailed {
                message: "volume not in required state, it is not in use".to_owned(),
            });
        }

        let server_id = volume.references[0].product_resource_id.clone();
        let server = state
            .servers
            .get_mut(&server_id)
            .filter(|s| s.zone == zone)
            .ok_or(Error::NotFound {
                resource: SERVER_RESOURCE,
                id: server_id.clone(),
            })?;
        server.volumes.retain(|_, v| v.id != volume_id);

        let volume = state
            .volumes
            .get_mut(volume_id)
            .unwrap_or_else(|| unreachable!("volume presence checked above"));
        volume.references.clear();
        volume.status = VolumeStatus::Available;

        Ok(())
    }

    async fn get_server(&self, server_id: &str, zone: Option<Zone>) -> Result<Server, Error> {
        check_uuid(server_id, SERVER_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        self.state
            .lock()
            .servers
            .get(server_id)
            .filter(|s| s.zone == zone)
            .cloned()
            .ok_or(Error::NotFound {
                resource: SERVER_RESOURCE,
                id: server_id.to_owned(),
            })
    }

    async fn get_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<Snapshot, Error> {
        check_uuid(snapshot_id, SNAPSHOT_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        self.state
            .lock()
            .snapshots
            .get(snapshot_id)
            .filter(|s| s.zone == zone)
            .cloned()
            .ok_or(Error::NotFound {
                resource: SNAPSHOT_RESOURCE,
                id: snapshot_id.to_owned(),
            })
    }

    async fn get_snapshot_by_name(
        &self,
        name: &str,
        source_volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        let zone = self.zone_or_default(zone);
        let state = self.state.lock();

        for snapshot in state.snapshots.values() {
            if snapshot.name == name && snapshot.zone == zone {
                if snapshot
                    .parent_volume
                    .as_ref()
                    .is_some_and(|parent| parent.id != source_volume_id)
                {
                    return Err(Error::SnapshotExists);
                }
                return Ok(snapshot.clone());
            }
        }

        Err(Error::SnapshotNotFound)
    }

    async fn get_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<Volume, Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        self.state
            .lock()
            .volumes
            .get(volume_id)
            .filter(|v| v.zone == zone)
            .cloned()
            .ok_or(Error::NotFound {
                resource: VOLUME_RESOURCE,
                id: volume_id.to_owned(),
            })
    }

    async fn get_volume_by_name(
        &self,
        name: &str,
        size: u64,
        zone: Option<Zone>,
    ) -> Result<Volume, Error> {
        let zone = self.zone_or_default(zone);
        let state = self.state.lock();

        for volume in state.volumes.values() {
            if volume.name == name && volume.zone == zone {
                if volume.size != size {
                    return Err(Error::VolumeDifferentSize {
                        id: volume.id.clone(),
                    });
                }
                return Ok(volume.clone());
            }
        }

        Err(Error::VolumeNotFound)
    }

    async fn list_snapshots(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        let state = self.state.lock();
        let items = state
            .snapshots
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        Ok(Self::paginate(items, start, max))
    }

    async fn list_snapshots_by_source_volume(
        &self,
        start: u32,
        max: u32,
        source_volume_id: &str,
        source_volume_zone: Option<Zone>,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        let zone = self.zone_or_default(source_volume_zone);
        let state = self.state.lock();
        let items = state
            .snapshots
            .iter()
            .filter(|(_, s)| {
                s.zone == zone
                    && s.parent_volume
                        .as_ref()
                        .is_some_and(|parent| parent.id == source_volume_id)
            })
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        Ok(Self::paginate(items, start, max))
    }

    async fn list_volumes(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Volume>, Option<String>), Error> {
        let state = self.state.lock();
        let items = state
            .volumes
            .iter()
            .map(|(id, v)| (id.clone(), v.clone()))
            .collect();
        Ok(Self::paginate(items, start, max))
    }

    async fn resize_volume(
        &self,
        volume_id: &str,
        zone: Option<Zone>,
        size: u64,
    ) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;
        let zone = self.zone_or_default(zone);
        let mut state = self.state.lock();

        let volume = state
            .volumes
            .get_mut(volume_id)
            .filter(|v| v.zone == zone)
            .ok_or(Error::NotFound {
                resource: VOLUME_RESOURCE,
                id: volume_id.to_owned(),
            })?;

        if size < volume.size {
            return Err(Error::PreconditionFailed {
                message: "new volume size is less than current volume size".to_owned(),
            });
        }

        volume.size = size;
        Ok(())
    }

    async fn wait_for_snapshot(
        &self,
        snapshot_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        self.get_snapshot(snapshot_id, zone).await
    }

    fn default_zone(&self) -> Zone {
        self.default_zone
    }
}
