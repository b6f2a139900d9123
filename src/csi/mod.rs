//! K8S CSI driver services and their assembly.

pub mod controller;
pub mod diskutils;
pub mod identity;
mod luks;
pub mod node;
pub mod proto;
pub mod server;
pub mod util;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::info;

use self::controller::ControllerService;
use self::identity::IdentityService;
use self::node::NodeService;
use self::server::CsiServer;
use self::util::{DRIVER_NAME, DRIVER_VERSION};

/// The mode in which the CSI driver runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Run the controller service only.
    Controller,
    /// Run the node service only.
    Node,
    /// Run both the controller and the node service.
    All,
}

impl Mode {
    /// Whether the controller and node services should be started.
    fn services(self) -> (bool, bool) {
        match self {
            Self::Controller => (true, false),
            Self::Node => (false, true),
            Self::All => (true, true),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            Self::Controller => "controller",
            Self::Node => "node",
            Self::All => "all",
        };
        f.write_str(mode)
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::Controller),
            "node" => Ok(Self::Node),
            "all" => Ok(Self::All),
            other => Err(format!("unknown mode for driver: {other}")),
        }
    }
}

/// Configuration of the driver.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// URI of the CSI endpoint, `unix` scheme only.
    pub endpoint: String,
    /// Prefix added to the name of newly created volumes.
    pub prefix: String,
    /// Services to run.
    pub mode: Mode,
}

/// The assembled CSI plugin.
pub struct Driver {
    server: Arc<CsiServer>,
    endpoint: String,
}

impl Driver {
    /// Builds the services selected by the mode. The identity service always
    /// runs; the node service reads the local instance metadata at startup.
    pub async fn new(config: &DriverConfig) -> anyhow::Result<Self> {
        info!("Driver: {DRIVER_NAME} Version: {DRIVER_VERSION}");

        let (with_controller, with_node) = config.mode.services();

        let controller = if with_controller {
            Some(ControllerService::new(&config.prefix)?)
        } else {
            None
        };

        let node = if with_node {
            Some(NodeService::from_metadata().await?)
        } else {
            None
        };

        Ok(Self {
            server: Arc::new(CsiServer::new(IdentityService::new(), controller, node)),
            endpoint: config.endpoint.clone(),
        })
    }

    /// Runs the server until SIGINT or SIGTERM.
    pub async fn run(self) -> anyhow::Result<()> {
        let Self { server, endpoint } = self;
        server.serve(&endpoint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("controller".parse::<Mode>().expect("parse"), Mode::Controller);
        assert_eq!("node".parse::<Mode>().expect("parse"), Mode::Node);
        assert_eq!("all".parse::<Mode>().expect("parse"), Mode::All);
        assert!("sidecar".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_selects_services() {
        assert_eq!(Mode::Controller.services(), (true, false));
        assert_eq!(Mode::Node.services(), (false, true));
        assert_eq!(Mode::All.services(), (true, true));
    }
}
