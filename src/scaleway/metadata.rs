//! Instance metadata discovery for the node service.
//!
//! Metadata is read from a chain of sources: the cloud-init data file first,
//! then the link-local metadata API. The first source that answers with a
//! valid document wins.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use super::errors::Error;
use super::types::Zone;

const METADATA_API_URL: &str = "http://169.254.42.42/conf?format=json";
const METADATA_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CLOUD_INIT_DATA_FILE: &str = "/run/cloud-init/instance-data.json";

/// Location of the instance.
#[derive(Clone, Debug, Deserialize)]
pub struct MetadataLocation {
    pub zone_id: String,
}

/// A volume as reported by the instance metadata.
#[derive(Clone, Debug, Deserialize)]
pub struct MetadataVolume {
    #[serde(default)]
    pub volume_type: String,
}

/// Metadata of the instance that runs the node service.
#[derive(Clone, Debug, Deserialize)]
pub struct Metadata {
    pub id: String,
    pub location: MetadataLocation,
    #[serde(default)]
    pub volumes: HashMap<String, MetadataVolume>,
}

impl Metadata {
    /// Parsed zone of the instance.
    pub fn zone(&self) -> Result<Zone, Error> {
        self.location
            .zone_id
            .parse()
            .map_err(|_| Error::MetadataUnavailable)
    }
}

#[derive(Debug, Deserialize)]
struct CloudInitInstanceData {
    ds: CloudInitDs,
}

#[derive(Debug, Deserialize)]
struct CloudInitDs {
    #[serde(rename = "meta_data")]
    metadata: Option<Metadata>,
}

/// Reads metadata from the cloud-init data file left on disk at boot.
fn cloud_init_source(path: &Path) -> Result<Metadata, String> {
    let file = std::fs::File::open(path)
        .map_err(|e| format!("failed to open cloud-init data file: {e}"))?;
    let data: CloudInitInstanceData = serde_json::from_reader(file)
        .map_err(|e| format!("error decoding cloud-init data file: {e}"))?;

    let metadata = data
        .ds
        .metadata
        .ok_or_else(|| "missing metadata in cloud-init data file".to_owned())?;

    metadata
        .location
        .zone_id
        .parse::<Zone>()
        .map_err(|e| format!("zone is not valid in .location.zone_id: {e}"))?;

    Ok(metadata)
}

/// Reads metadata from the link-local metadata API with a bounded timeout.
async fn api_source() -> Result<Metadata, String> {
    let client = reqwest::Client::builder()
        .timeout(METADATA_REQUEST_TIMEOUT)
        .build()
        .map_err(|e| format!("failed to create metadata client: {e}"))?;

    let response = client
        .get(METADATA_API_URL)
        .send()
        .await
        .map_err(|e| format!("failed to get metadata from API: {e}"))?;

    if !response.status().is_success() {
        return Err(format!(
            "metadata API did not return 200: got {}",
            response.status().as_u16()
        ));
    }

    response
        .json()
        .await
        .map_err(|e| format!("error decoding metadata: {e}"))
}

/// Gets metadata of the instance that runs this function, trying each source
/// successively (cloud-init, api) until one responds successfully.
pub async fn get_metadata() -> Result<Metadata, Error> {
    match cloud_init_source(Path::new(CLOUD_INIT_DATA_FILE)) {
        Ok(metadata) => return Ok(metadata),
        Err(err) => warn!("failed to get metadata from cloud-init source: {err}"),
    }

    match api_source().await {
        Ok(metadata) => Ok(metadata),
        Err(err) => {
            warn!("failed to get metadata from API source: {err}");
            Err(Error::MetadataUnavailable)
        }
    }
}
