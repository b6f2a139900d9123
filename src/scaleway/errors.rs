//! Error taxonomy of the Scaleway client.

use thiserror::Error;

use super::types::{SnapshotStatus, VolumeStatus};

/// Errors returned by the Scaleway client and its in-memory fake.
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// The resource does not exist. Also synthesized locally for IDs that are
    /// not well-formed UUIDs, before any network call is made.
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    /// The resource was deleted; the Block API surfaces this as HTTP 410.
    #[error("{resource} {id} is gone")]
    Gone { resource: &'static str, id: String },

    /// The API refused the operation in the current resource state, e.g.
    /// deleting a volume that still has a server reference.
    #[error("precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// A volume with the requested name exists but has a different size.
    #[error("volume already exists with a different size: {id}")]
    VolumeDifferentSize { id: String },

    /// A snapshot with the requested name exists but has a different source
    /// volume.
    #[error("snapshot exists but has a different source volume")]
    SnapshotExists,

    /// No volume with the requested name exists in the zone.
    #[error("volume not found")]
    VolumeNotFound,

    /// No snapshot with the requested name exists in the zone.
    #[error("snapshot not found")]
    SnapshotNotFound,

    /// A wait loop ended on a status other than the expected one.
    #[error("volume {id} is in state {status}")]
    UnexpectedVolumeStatus { id: String, status: VolumeStatus },

    /// A wait loop ended on a snapshot status other than the expected one.
    #[error("snapshot {id} is in state {status}")]
    UnexpectedSnapshotStatus { id: String, status: SnapshotStatus },

    /// A wait loop gave up before the resource reached a terminal state.
    #[error("timed out waiting for {resource} {id}")]
    WaitTimeout { resource: &'static str, id: String },

    /// The server already hosts the maximum number of volumes.
    #[error("server {id} has reached max volume capacity")]
    MaxVolumesReached { id: String },

    /// Any other error status returned by the API.
    #[error("api returned status {status}: {message}")]
    Api { status: u16, message: String },

    /// The request never reached the API (connection, timeout, decoding).
    #[error("request to Scaleway API failed: {0}")]
    Transport(String),

    /// Client construction failed because no locality is configured.
    #[error("no zone or region was provided, please set the SCW_DEFAULT_ZONE environment variable")]
    NoZoneConfigured,

    /// Client construction failed because a credential is missing.
    #[error("missing {0} in environment")]
    MissingEnv(&'static str),

    /// No metadata source answered.
    #[error("no metadata source responded successfully")]
    MetadataUnavailable,
}

impl Error {
    /// True if the error means the resource does not exist, including the
    /// "gone" answer the Block API gives for deleted resources.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Gone { .. })
    }

    /// True if the error is a precondition failure.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Maps an HTTP error response to the client error taxonomy.
pub(crate) fn error_from_response(
    status: u16,
    body: String,
    resource: &'static str,
    id: &str,
) -> Error {
    match status {
        404 => Error::NotFound {
            resource,
            id: id.to_owned(),
        },
        410 => Error::Gone {
            resource,
            id: id.to_owned(),
        },
        412 => Error::PreconditionFailed { message: body },
        _ => Error::Api {
            status,
            message: body,
        },
    }
}
