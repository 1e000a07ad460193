use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use smalledger_infra::LedgerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    smalledger_observability::init();

    let config = LedgerConfig::from_env().context("invalid configuration")?;
    let services = smalledger_api::app::services::build_services(&config)
        .await
        .context("failed to wire services")?;

    let app = smalledger_api::app::build_app(Arc::new(services));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
