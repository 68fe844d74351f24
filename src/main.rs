//! Headless relay daemon: opens the local store, restores the saved
//! webhook endpoint (or takes one from the environment), and runs the
//! background sync loop until interrupted.

use anyhow::Context;
use std::path::PathBuf;
use tracing::info;

use bulkorder_relay::{db, sync, AppContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    bulkorder_relay::init_tracing();
    info!("Starting BulkOrder relay v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = std::env::var("BULKORDER_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data"));
    let db_state = db::init(&data_dir).context("initialize local store")?;
    let ctx = AppContext::new(db_state);

    if let Ok(url) = std::env::var("BULKORDER_WEBHOOK_URL") {
        ctx.set_endpoint_url(&url).context("save webhook endpoint")?;
    }
    match ctx.endpoint_url() {
        Some(url) => info!(endpoint = %url, "webhook endpoint configured"),
        None => info!("no webhook endpoint configured; set BULKORDER_WEBHOOK_URL to enable sync"),
    }

    let loop_handle = sync::start_sync_loop(ctx.clone(), 15);

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("Shutting down");
    sync::stop_sync_loop(&ctx);
    loop_handle.abort();

    Ok(())
}
