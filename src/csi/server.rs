//! Unix-socket RPC server for the CSI services.
//!
//! The gRPC wire surface proper is generated mechanically outside this
//! crate; in-process the services exchange the [`Request`]/[`Response`]
//! envelope as length-prefixed JSON frames over the unix socket. The server
//! owns the external-interface plumbing: `unix` scheme enforcement, stale
//! socket removal, per-request logging and graceful stop on SIGINT/SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::controller::ControllerService;
use super::identity::IdentityService;
use super::node::NodeService;
use super::proto::*;

/// Frames larger than this are rejected as malformed.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Request envelope: one variant per CSI method.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Request {
    // Identity.
    GetPluginInfo(GetPluginInfoRequest),
    GetPluginCapabilities(GetPluginCapabilitiesRequest),
    Probe(ProbeRequest),

    // Controller.
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(DeleteVolumeRequest),
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesRequest),
    ListVolumes(ListVolumesRequest),
    ControllerGetCapabilities(ControllerGetCapabilitiesRequest),
    CreateSnapshot(CreateSnapshotRequest),
    DeleteSnapshot(DeleteSnapshotRequest),
    ListSnapshots(ListSnapshotsRequest),
    ControllerExpandVolume(ControllerExpandVolumeRequest),
    ControllerGetVolume(ControllerGetVolumeRequest),

    // Node.
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume(NodeUnstageVolumeRequest),
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume(NodeUnpublishVolumeRequest),
    NodeGetVolumeStats(NodeGetVolumeStatsRequest),
    NodeExpandVolume(NodeExpandVolumeRequest),
    NodeGetCapabilities(NodeGetCapabilitiesRequest),
    NodeGetInfo(NodeGetInfoRequest),
}

/// Response envelope mirroring [`Request`], plus the error variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Response {
    GetPluginInfo(GetPluginInfoResponse),
    GetPluginCapabilities(GetPluginCapabilitiesResponse),
    Probe(ProbeResponse),

    CreateVolume(CreateVolumeResponse),
    DeleteVolume(DeleteVolumeResponse),
    ControllerPublishVolume(ControllerPublishVolumeResponse),
    ControllerUnpublishVolume(ControllerUnpublishVolumeResponse),
    ValidateVolumeCapabilities(ValidateVolumeCapabilitiesResponse),
    ListVolumes(ListVolumesResponse),
    ControllerGetCapabilities(ControllerGetCapabilitiesResponse),
    CreateSnapshot(CreateSnapshotResponse),
    DeleteSnapshot(DeleteSnapshotResponse),
    ListSnapshots(ListSnapshotsResponse),
    ControllerExpandVolume(ControllerExpandVolumeResponse),
    ControllerGetVolume(ControllerGetVolumeResponse),

    NodeStageVolume(NodeStageVolumeResponse),
    NodeUnstageVolume(NodeUnstageVolumeResponse),
    NodePublishVolume(NodePublishVolumeResponse),
    NodeUnpublishVolume(NodeUnpublishVolumeResponse),
    NodeGetVolumeStats(NodeGetVolumeStatsResponse),
    NodeExpandVolume(NodeExpandVolumeResponse),
    NodeGetCapabilities(NodeGetCapabilitiesResponse),
    NodeGetInfo(NodeGetInfoResponse),

    Error(Status),
}

/// Derives the socket path from the endpoint URI. Only the `unix` scheme is
/// supported.
pub fn endpoint_socket_path(endpoint: &str) -> anyhow::Result<PathBuf> {
    let (scheme, rest) = endpoint
        .split_once(':')
        .ok_or_else(|| anyhow!("invalid endpoint {endpoint:?}"))?;

    if scheme != "unix" {
        return Err(anyhow!(
            "only unix domain sockets are supported, not {scheme}"
        ));
    }

    let path = rest.strip_prefix("//").unwrap_or(rest);
    if path.is_empty() {
        return Err(anyhow!("no socket path in endpoint {endpoint:?}"));
    }

    Ok(PathBuf::from(path))
}

pub(crate) async fn write_frame<W, T>(writer: &mut W, message: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(message)?;
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Reads one frame; `None` when the peer closed the connection cleanly.
pub(crate) async fn read_frame<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_buf = [0_u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit"),
        ));
    }

    let mut payload = vec![0_u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// CSI server exposing the identity service and, depending on the mode, the
/// controller and node services.
pub struct CsiServer {
    identity: IdentityService,
    controller: Option<ControllerService>,
    node: Option<NodeService>,
}

impl CsiServer {
    pub fn new(
        identity: IdentityService,
        controller: Option<ControllerService>,
        node: Option<NodeService>,
    ) -> Self {
        Self {
            identity,
            controller,
            node,
        }
    }

    fn controller(&self) -> Result<&ControllerService, Status> {
        self.controller
            .as_ref()
            .ok_or_else(|| Status::unimplemented("controller service is not enabled"))
    }

    fn node(&self) -> Result<&NodeService, Status> {
        self.node
            .as_ref()
            .ok_or_else(|| Status::unimplemented("node service is not enabled"))
    }

    /// Serves the CSI services on the endpoint until SIGINT or SIGTERM, then
    /// drains the in-flight requests before returning.
    pub async fn serve(self: Arc<Self>, endpoint: &str) -> anyhow::Result<()> {
        let socket_path = endpoint_socket_path(endpoint)?;

        if let Some(parent) = socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create dir for socket: {parent:?}"))?;
            }
        }

        // Remove a stale socket left by a previous run.
        match std::fs::remove_file(&socket_path) {
            Ok(()) => info!("removed existing socket at {}", socket_path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(anyhow!("error removing existing socket: {err}")),
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to create listener on {socket_path:?}"))?;

        let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

        info!("CSI server started on {endpoint}");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted.context("failed to accept connection")?;
                    let server = Arc::clone(&self);
                    let shutdown = shutdown_rx.clone();
                    connections.spawn(async move {
                        if let Err(err) = server.handle_connection(stream, shutdown).await {
                            warn!("connection handler error: {err}");
                        }
                    });
                }
            }
        }

        // In-flight requests run to completion; idle connections are closed.
        info!("shutting down, draining in-flight requests");
        drop(listener);
        let _ = shutdown_tx.send(true);
        while connections.join_next().await.is_some() {}
        let _ = std::fs::remove_file(&socket_path);

        Ok(())
    }

    /// Serves one connection: request frames in, response frames out. The
    /// connection is closed once the shutdown channel fires and no request
    /// is being processed.
    pub(crate) async fn handle_connection(
        &self,
        mut stream: UnixStream,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        loop {
            let request = tokio::select! {
                request = read_frame::<_, Request>(&mut stream) => request?,
                _ = shutdown.changed() => return Ok(()),
            };

            match request {
                Some(request) => {
                    let response = self.dispatch(request).await;
                    write_frame(&mut stream, &response).await?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Routes the request to the right service and logs the scrubbed request
    /// and any error, like a unary logging interceptor would.
    pub(crate) async fn dispatch(&self, request: Request) -> Response {
        fn finish<T>(method: &str, result: Result<T, Status>, wrap: fn(T) -> Response) -> Response {
            match result {
                Ok(resp) => wrap(resp),
                Err(status) => {
                    error!("error for {method}: {status}");
                    Response::Error(status)
                }
            }
        }

        match request {
            Request::GetPluginInfo(req) => {
                debug!("GetPluginInfo called with {req:?}");
                finish(
                    "GetPluginInfo",
                    self.identity.get_plugin_info(req).await,
                    Response::GetPluginInfo,
                )
            }
            Request::GetPluginCapabilities(req) => {
                debug!("GetPluginCapabilities called with {req:?}");
                finish(
                    "GetPluginCapabilities",
                    self.identity.get_plugin_capabilities(req).await,
                    Response::GetPluginCapabilities,
                )
            }
            Request::Probe(req) => {
                debug!("Probe called with {req:?}");
                finish("Probe", self.identity.probe(req).await, Response::Probe)
            }

            Request::CreateVolume(req) => {
                debug!("CreateVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "CreateVolume",
                        controller.create_volume(req).await,
                        Response::CreateVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::DeleteVolume(req) => {
                debug!("DeleteVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "DeleteVolume",
                        controller.delete_volume(req).await,
                        Response::DeleteVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ControllerPublishVolume(req) => {
                debug!("ControllerPublishVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ControllerPublishVolume",
                        controller.controller_publish_volume(req).await,
                        Response::ControllerPublishVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ControllerUnpublishVolume(req) => {
                debug!("ControllerUnpublishVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ControllerUnpublishVolume",
                        controller.controller_unpublish_volume(req).await,
                        Response::ControllerUnpublishVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ValidateVolumeCapabilities(req) => {
                debug!("ValidateVolumeCapabilities called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ValidateVolumeCapabilities",
                        controller.validate_volume_capabilities(req).await,
                        Response::ValidateVolumeCapabilities,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ListVolumes(req) => {
                debug!("ListVolumes called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ListVolumes",
                        controller.list_volumes(req).await,
                        Response::ListVolumes,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ControllerGetCapabilities(req) => {
                debug!("ControllerGetCapabilities called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ControllerGetCapabilities",
                        controller.controller_get_capabilities(req).await,
                        Response::ControllerGetCapabilities,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::CreateSnapshot(req) => {
                debug!("CreateSnapshot called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "CreateSnapshot",
                        controller.create_snapshot(req).await,
                        Response::CreateSnapshot,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::DeleteSnapshot(req) => {
                debug!("DeleteSnapshot called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "DeleteSnapshot",
                        controller.delete_snapshot(req).await,
                        Response::DeleteSnapshot,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ListSnapshots(req) => {
                debug!("ListSnapshots called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ListSnapshots",
                        controller.list_snapshots(req).await,
                        Response::ListSnapshots,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ControllerExpandVolume(req) => {
                debug!("ControllerExpandVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ControllerExpandVolume",
                        controller.controller_expand_volume(req).await,
                        Response::ControllerExpandVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::ControllerGetVolume(req) => {
                debug!("ControllerGetVolume called with {req:?}");
                match self.controller() {
                    Ok(controller) => finish(
                        "ControllerGetVolume",
                        controller.controller_get_volume(req).await,
                        Response::ControllerGetVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }

            Request::NodeStageVolume(req) => {
                debug!("NodeStageVolume called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeStageVolume",
                        node.node_stage_volume(req).await,
                        Response::NodeStageVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeUnstageVolume(req) => {
                debug!("NodeUnstageVolume called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeUnstageVolume",
                        node.node_unstage_volume(req).await,
                        Response::NodeUnstageVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodePublishVolume(req) => {
                debug!("NodePublishVolume called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodePublishVolume",
                        node.node_publish_volume(req).await,
                        Response::NodePublishVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeUnpublishVolume(req) => {
                debug!("NodeUnpublishVolume called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeUnpublishVolume",
                        node.node_unpublish_volume(req).await,
                        Response::NodeUnpublishVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeGetVolumeStats(req) => {
                debug!("NodeGetVolumeStats called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeGetVolumeStats",
                        node.node_get_volume_stats(req).await,
                        Response::NodeGetVolumeStats,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeExpandVolume(req) => {
                debug!("NodeExpandVolume called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeExpandVolume",
                        node.node_expand_volume(req).await,
                        Response::NodeExpandVolume,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeGetCapabilities(req) => {
                debug!("NodeGetCapabilities called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeGetCapabilities",
                        node.node_get_capabilities(req).await,
                        Response::NodeGetCapabilities,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
            Request::NodeGetInfo(req) => {
                debug!("NodeGetInfo called with {req:?}");
                match self.node() {
                    Ok(node) => finish(
                        "NodeGetInfo",
                        node.node_get_info(req).await,
                        Response::NodeGetInfo,
                    ),
                    Err(status) => Response::Error(status),
                }
            }
        }
    }
}
