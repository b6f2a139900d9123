//! Server operations against the Instance API: lookup, attach and detach.
//!
//! The Instance API has no attach endpoint for Block Storage volumes; the
//! server's volume map is PATCHed instead, preserving the existing slots.

use std::collections::HashMap;

use super::errors::Error;
use super::helpers::check_uuid;
use super::types::{
    GetServerResponse, ReferenceStatus, Server, ServerVolumeTemplate, UpdateServerVolumesBody,
    VolumeStatus, Zone,
};
use super::{
    Client, INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE, MAX_VOLUMES_PER_NODE, SERVER_RESOURCE,
    VOLUME_RESOURCE,
};

/// `volume_type` to use when attaching a Block Storage volume to a server.
const SBS_VOLUME_TYPE: &str = "sbs_volume";

impl Client {
    fn server_path(zone: Zone, server_id: &str) -> String {
        format!("/instance/v1/zones/{zone}/servers/{server_id}")
    }

    pub(crate) async fn do_get_server(&self, server_id: &str, zone: Zone) -> Result<Server, Error> {
        check_uuid(server_id, SERVER_RESOURCE)?;
        let resp: GetServerResponse = self
            .get_json(
                &Self::server_path(zone, server_id),
                &[],
                SERVER_RESOURCE,
                server_id,
            )
            .await?;
        Ok(resp.server)
    }

    async fn patch_server_volumes(
        &self,
        server_id: &str,
        zone: Zone,
        volumes: HashMap<String, ServerVolumeTemplate>,
    ) -> Result<(), Error> {
        let _: GetServerResponse = self
            .patch_json(
                &Self::server_path(zone, server_id),
                &UpdateServerVolumesBody { volumes },
                SERVER_RESOURCE,
                server_id,
            )
            .await?;
        Ok(())
    }

    /// Keeps the current attachments as-is in a PATCH body. Slots must be
    /// re-sent verbatim or the Instance API detaches them.
    fn retained_volumes(server: &Server) -> HashMap<String, ServerVolumeTemplate> {
        server
            .volumes
            .iter()
            .map(|(slot, volume)| {
                (
                    slot.clone(),
                    ServerVolumeTemplate {
                        id: volume.id.clone(),
                        volume_type: Some(volume.volume_type.clone()),
                        boot: volume.boot,
                    },
                )
            })
            .collect()
    }

    pub(crate) async fn do_attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        zone: Zone,
    ) -> Result<(), Error> {
        check_uuid(server_id, SERVER_RESOURCE)?;
        check_uuid(volume_id, VOLUME_RESOURCE)?;

        let server = self.do_get_server(server_id, zone).await?;
        let mut volumes = Self::retained_volumes(&server);

        if volumes.len() >= MAX_VOLUMES_PER_NODE {
            return Err(Error::MaxVolumesReached {
                id: server_id.to_owned(),
            });
        }

        // First free slot, "0" being the root volume. One always exists
        // below capacity.
        let slot = (0..=volumes.len())
            .map(|i| i.to_string())
            .find(|key| !volumes.contains_key(key))
            .ok_or_else(|| Error::MaxVolumesReached {
                id: server_id.to_owned(),
            })?;

        volumes.insert(
            slot,
            ServerVolumeTemplate {
                id: volume_id.to_owned(),
                volume_type: Some(SBS_VOLUME_TYPE.to_owned()),
                boot: None,
            },
        );

        self.patch_server_volumes(server_id, zone, volumes).await?;

        self.wait_for_volume_and_references(
            volume_id,
            zone,
            VolumeStatus::InUse,
            ReferenceStatus::Attached,
        )
        .await?;

        Ok(())
    }

    pub(crate) async fn do_detach_volume(&self, volume_id: &str, zone: Zone) -> Result<(), Error> {
        check_uuid(volume_id, VOLUME_RESOURCE)?;

        // The attachment is on the server side; find the server through the
        // volume's references.
        let volume = self.do_get_volume(volume_id, zone).await?;
        let server_id = volume
            .references
            .iter()
            .find(|r| r.product_resource_type == INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE)
            .map(|r| r.product_resource_id.clone())
            .ok_or(Error::PreconditionFailed {
                message: format!("volume {volume_id} is not attached to a server"),
            })?;

        let server = self.do_get_server(&server_id, zone).await?;
        let mut volumes = Self::retained_volumes(&server);
        volumes.retain(|_, template| template.id != volume_id);

        self.patch_server_volumes(&server_id, zone, volumes).await?;

        self.wait_for_volume_and_references(
            volume_id,
            zone,
            VolumeStatus::Available,
            ReferenceStatus::Detached,
        )
        .await?;

        Ok(())
    }
}
