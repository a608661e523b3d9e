//! pi-obd - battery telemetry service entry point

use anyhow::Context;
use api::{init_logging, run, AppConfig, NAME};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("loading configuration")?;
    init_logging(&config.log);

    info!("=== {} v{} ===", NAME, env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(config).await {
        error!("{:#}", e);
        return Err(e);
    }
    Ok(())
}
