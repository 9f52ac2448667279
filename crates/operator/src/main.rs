use anyhow::Context;
use kube::Client;
use odoo_operator::config::OperatorConfig;
use odoo_operator::{controller, logging};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = OperatorConfig::from_env().context("load operator configuration")?;
    logging::init_logging(&config.log_level, &config.log_format)?;
    let client = Client::try_default().await.context("build kubernetes client")?;
    info!(version = env!("CARGO_PKG_VERSION"), "odoo operator starting");
    controller::run(client, config).await
}
