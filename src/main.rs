//! Entry point of the `scaleway-csi` driver.

use clap::Parser;

use scaleway_csi::common::logger;
use scaleway_csi::config::Config;
use scaleway_csi::csi::{Driver, DriverConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    logger::init_logger(&config.log_level);

    let driver = Driver::new(&DriverConfig {
        endpoint: config.endpoint.clone(),
        prefix: config.prefix.clone(),
        mode: config.mode,
    })
    .await?;

    driver.run().await
}
