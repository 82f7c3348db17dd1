//! HTTP server assembly: merges the ComfyUI-compatible proxy surface with
//! the `/lb/*` admin surface onto one listener (spec.md §6 lists both under
//! the single `server.host`/`server.port`).

use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

use crate::{admin, proxy, App};

pub async fn start(app: Arc<App>, shutdown: Arc<Notify>) -> Result<()> {
    let addr = format!("{}:{}", app.config.server.host, app.config.server.port);
    let router = proxy::router().merge(admin::router()).with_state(app);

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "comfy-lb listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.notified().await })
        .await?;

    info!("comfy-lb server stopped");
    Ok(())
}
