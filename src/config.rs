//! Command-line configuration of the driver.

use clap::Parser;

use crate::csi::Mode;

/// Scaleway Block Storage CSI driver.
#[derive(Debug, Parser)]
#[command(name = "scaleway-csi", version, about, long_about = None)]
pub struct Config {
    /// CSI endpoint, a unix socket URI.
    #[arg(long, value_name = "ENDPOINT", default_value = "unix:/tmp/csi.sock")]
    pub endpoint: String,

    /// Prefix to add in block volume names.
    #[arg(long, value_name = "PREFIX", default_value = "")]
    pub prefix: String,

    /// The mode in which the CSI driver will be run (all, node, controller).
    #[arg(long, value_name = "MODE", default_value = "all")]
    pub mode: Mode,

    /// Log level.
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "debug")]
    pub log_level: String,
}
