use std::net::SocketAddr;
use std::sync::Arc;

use envconfig::Envconfig;
use kube::Client;
use tokio::try_join;
use tracing::info;
use usage_guard::{
    config::GuardConfig, controller::run_controller, index,
    index::UsageIndex, init_tracing, webhook,
};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing("info");

    let cfg = GuardConfig::init_from_env()?;
    info!(?cfg, "Starting usage-guard");

    let client = Client::try_default().await?;
    let usage_index = Arc::new(UsageIndex::new());

    let http_addr: SocketAddr = ([0, 0, 0, 0], cfg.http_port).into();

    let indexer = tokio::spawn(index::run_index(
        client.clone(),
        usage_index.clone(),
    ));
    let controller_client = client.clone();
    let controller_cfg = cfg.clone();
    let controller = tokio::spawn(async move {
        run_controller(controller_client, controller_cfg).await
    });
    let server = tokio::spawn(webhook::run_webhook_server(
        http_addr,
        usage_index.clone(),
    ));

    // If any fails, bubble up
    let (i_res, c_res, s_res) = try_join!(indexer, controller, server)?;
    i_res?;
    c_res?;
    s_res?;
    Ok(())
}
