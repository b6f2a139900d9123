//! Thin, typed wrapper over the Scaleway Block Storage and Instance APIs.
//!
//! The [`Api`] trait is the seam between the CSI services and the cloud: the
//! production implementation is [`Client`], an HTTP client over the public
//! APIs, and [`Fake`] is a fully in-memory implementation with the same
//! contract used by the sanity tests.

mod block;
mod errors;
mod fake;
mod helpers;
mod instance;
mod metadata;
mod types;

use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::errors::Error;
pub use self::fake::Fake;
pub use self::metadata::{get_metadata, Metadata, MetadataLocation, MetadataVolume};
pub use self::types::{
    Reference, ReferenceStatus, Region, Server, ServerVolume, Snapshot, SnapshotParentVolume,
    SnapshotStatus, Volume, VolumeSpecifications, VolumeStatus, Zone,
};

/// Maximum number of volumes attached to one node, root volume included.
pub const MAX_VOLUMES_PER_NODE: usize = 16;

/// Legacy default type for Scaleway Block volumes that used the Instance API.
/// Kept for backward compatibility; equivalent to the 5K IOPS volumes.
pub const LEGACY_DEFAULT_VOLUME_TYPE: &str = "b_ssd";

/// Number of IOPS of the legacy default volume type.
pub const LEGACY_DEFAULT_VOLUME_TYPE_IOPS: u32 = 5000;

/// Minimum size of a volume, in bytes (1 GB).
pub const MIN_VOLUME_SIZE: u64 = 1_000_000_000;

/// `product_resource_type` of an instance server in a volume reference.
pub const INSTANCE_SERVER_PRODUCT_RESOURCE_TYPE: &str = "instance_server";

pub(crate) const VOLUME_RESOURCE: &str = "volume";
pub(crate) const SERVER_RESOURCE: &str = "server";
pub(crate) const SNAPSHOT_RESOURCE: &str = "snapshot";

const DEFAULT_API_URL: &str = "https://api.scaleway.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of the wait-for-state loops.
pub(crate) const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound of the wait-for-state loops.
pub(crate) const WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// Operations the driver needs from the Scaleway APIs. All calls are
/// cancellable by dropping the returned future.
#[async_trait]
pub trait Api: Send + Sync {
    /// Attaches the volume to the server, then waits for the volume to be
    /// `in_use` with an `attached` reference.
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<(), Error>;

    /// Creates a snapshot of the volume.
    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error>;

    /// Creates a volume, either empty or from a snapshot, then waits for it
    /// to be `available`.
    async fn create_volume(
        &self,
        name: &str,
        snapshot_id: Option<&str>,
        size: u64,
        perf_iops: Option<u32>,
        zone: Option<Zone>,
    ) -> Result<Volume, Error>;

    /// Deletes a snapshot by ID.
    async fn delete_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<(), Error>;

    /// Deletes a volume by ID.
    async fn delete_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error>;

    /// Detaches the volume from its server, then waits for the volume to be
    /// `available` with its references `detached`.
    async fn detach_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error>;

    /// Returns the server with the given ID.
    async fn get_server(&self, server_id: &str, zone: Option<Zone>) -> Result<Server, Error>;

    /// Returns the snapshot with the given ID.
    async fn get_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<Snapshot, Error>;

    /// Finds a snapshot by exact name. Fails with [`Error::SnapshotExists`]
    /// when a snapshot with this name has a different source volume.
    async fn get_snapshot_by_name(
        &self,
        name: &str,
        source_volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error>;

    /// Returns the volume with the given ID.
    async fn get_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<Volume, Error>;

    /// Finds a volume by exact name. Fails with
    /// [`Error::VolumeDifferentSize`] when the name exists with another size.
    async fn get_volume_by_name(
        &self,
        name: &str,
        size: u64,
        zone: Option<Zone>,
    ) -> Result<Volume, Error>;

    /// Lists snapshots in all zones of the region. See
    /// [`helpers::paginated_list`] for the pagination contract.
    async fn list_snapshots(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error>;

    /// Lists the snapshots cut from the given source volume.
    async fn list_snapshots_by_source_volume(
        &self,
        start: u32,
        max: u32,
        source_volume_id: &str,
        source_volume_zone: Option<Zone>,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error>;

    /// Lists volumes in all zones of the region.
    async fn list_volumes(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Volume>, Option<String>), Error>;

    /// Grows the volume to the new size in bytes, then waits for the resize
    /// to complete. The final status must be `available` or `in_use`.
    async fn resize_volume(
        &self,
        volume_id: &str,
        zone: Option<Zone>,
        size: u64,
    ) -> Result<(), Error>;

    /// Waits for the snapshot to reach a terminal status and returns it.
    async fn wait_for_snapshot(
        &self,
        snapshot_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error>;

    /// Zone used when a request does not carry one.
    fn default_zone(&self) -> Zone;
}

/// Production client over the Scaleway HTTP APIs.
pub struct Client {
    http: reqwest::Client,
    api_url: String,
    project_id: String,
    default_zone: Zone,
    zones: Vec<Zone>,
}

impl Client {
    /// Builds a client from the standard `SCW_*` environment variables, using
    /// the given user agent. Fails when credentials or locality are missing.
    pub fn new(user_agent: &str) -> Result<Self, Error> {
        let secret_key = env::var("SCW_SECRET_KEY").map_err(|_| Error::MissingEnv("SCW_SECRET_KEY"))?;
        let project_id = env::var("SCW_DEFAULT_PROJECT_ID")
            .map_err(|_| Error::MissingEnv("SCW_DEFAULT_PROJECT_ID"))?;

        let default_zone = match env::var("SCW_DEFAULT_ZONE") {
            Ok(raw) => Some(raw.parse::<Zone>().map_err(|_| Error::NoZoneConfigured)?),
            Err(_) => None,
        };
        let default_region = match env::var("SCW_DEFAULT_REGION") {
            Ok(raw) => Some(raw.parse::<Region>().map_err(|_| Error::NoZoneConfigured)?),
            Err(_) => None,
        };
        let (default_zone, zones) = helpers::client_zones(default_zone, default_region)?;

        let api_url = env::var("SCW_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_owned());

        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&secret_key)
            .map_err(|_| Error::MissingEnv("SCW_SECRET_KEY"))?;
        headers.insert("X-Auth-Token", token);

        let http = reqwest::Client::builder()
            .user_agent(user_agent.to_owned())
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            api_url,
            project_id,
            default_zone,
            zones,
        })
    }

    /// Zones of the region where the client is configured.
    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub(crate) fn zone_or_default(&self, zone: Option<Zone>) -> Zone {
        zone.unwrap_or(self.default_zone)
    }

    pub(crate) fn project_id(&self) -> &str {
        &self.project_id
    }

    async fn check_response<T: DeserializeOwned>(
        response: reqwest::Response,
        resource: &'static str,
        id: &str,
    ) -> Result<T, Error> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(errors::error_from_response(status.as_u16(), body, resource, id));
        }
        Ok(response.json().await?)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        resource: &'static str,
        id: &str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(format!("{}{}", self.api_url, path))
            .query(query)
            .send()
            .await?;
        Self::check_response(response, resource, id).await
    }

    pub(crate) async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        resource: &'static str,
        id: &str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .post(format!("{}{}", self.api_url, path))
            .json(body)
            .send()
            .await?;
        Self::check_response(response, resource, id).await
    }

    pub(crate) async fn patch_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        resource: &'static str,
        id: &str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .patch(format!("{}{}", self.api_url, path))
            .json(body)
            .send()
            .await?;
        Self::check_response(response, resource, id).await
    }

    pub(crate) async fn delete(
        &self,
        path: &str,
        resource: &'static str,
        id: &str,
    ) -> Result<(), Error> {
        let response = self
            .http
            .delete(format!("{}{}", self.api_url, path))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(errors::error_from_response(status.as_u16(), body, resource, id));
        }
        Ok(())
    }
}

#[async_trait]
impl Api for Client {
    async fn attach_volume(
        &self,
        server_id: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<(), Error> {
        let zone = self.zone_or_default(zone);
        self.do_attach_volume(server_id, volume_id, zone).await
    }

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        let zone = self.zone_or_default(zone);
        self.do_create_snapshot(name, volume_id, zone).await
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
        self.do_create_volume(name, snapshot_id, size, perf_iops, zone)
            .await
    }

    async fn delete_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        let zone = self.zone_or_default(zone);
        self.do_delete_snapshot(snapshot_id, zone).await
    }

    async fn delete_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        let zone = self.zone_or_default(zone);
        self.do_delete_volume(volume_id, zone).await
    }

    async fn detach_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<(), Error> {
        let zone = self.zone_or_default(zone);
        self.do_detach_volume(volume_id, zone).await
    }

    async fn get_server(&self, server_id: &str, zone: Option<Zone>) -> Result<Server, Error> {
        let zone = self.zone_or_default(zone);
        self.do_get_server(server_id, zone).await
    }

    async fn get_snapshot(&self, snapshot_id: &str, zone: Option<Zone>) -> Result<Snapshot, Error> {
        let zone = self.zone_or_default(zone);
        self.do_get_snapshot(snapshot_id, zone).await
    }

    async fn get_snapshot_by_name(
        &self,
        name: &str,
        source_volume_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        let zone = self.zone_or_default(zone);
        self.do_get_snapshot_by_name(name, source_volume_id, zone)
            .await
    }

    async fn get_volume(&self, volume_id: &str, zone: Option<Zone>) -> Result<Volume, Error> {
        let zone = self.zone_or_default(zone);
        self.do_get_volume(volume_id, zone).await
    }

    async fn get_volume_by_name(
        &self,
        name: &str,
        size: u64,
        zone: Option<Zone>,
    ) -> Result<Volume, Error> {
        let zone = self.zone_or_default(zone);
        self.do_get_volume_by_name(name, size, zone).await
    }

    async fn list_snapshots(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        self.do_list_snapshots(start, max).await
    }

    async fn list_snapshots_by_source_volume(
        &self,
        start: u32,
        max: u32,
        source_volume_id: &str,
        source_volume_zone: Option<Zone>,
    ) -> Result<(Vec<Snapshot>, Option<String>), Error> {
        let zone = self.zone_or_default(source_volume_zone);
        self.do_list_snapshots_by_source_volume(start, max, source_volume_id, zone)
            .await
    }

    async fn list_volumes(
        &self,
        start: u32,
        max: u32,
    ) -> Result<(Vec<Volume>, Option<String>), Error> {
        self.do_list_volumes(start, max).await
    }

    async fn resize_volume(
        &self,
        volume_id: &str,
        zone: Option<Zone>,
        size: u64,
    ) -> Result<(), Error> {
        let zone = self.zone_or_default(zone);
        self.do_resize_volume(volume_id, zone, size).await
    }

    async fn wait_for_snapshot(
        &self,
        snapshot_id: &str,
        zone: Option<Zone>,
    ) -> Result<Snapshot, Error> {
        let zone = self.zone_or_default(zone);
        self.do_wait_for_snapshot(snapshot_id, zone).await
    }

    fn default_zone(&self) -> Zone {
        self.default_zone
    }
}
