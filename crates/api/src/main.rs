use std::sync::Arc;

use anyhow::Context;

use finadvisor_api::config::BridgeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    finadvisor_observability::init();

    let config = BridgeConfig::from_env();
    tracing::info!(
        port = config.port,
        transport = ?config.transport,
        analysis_timeout_ms = config.analysis_timeout.as_millis() as u64,
        health_timeout_ms = config.health_timeout.as_millis() as u64,
        "starting financial analysis bridge"
    );

    let services = Arc::new(finadvisor_api::app::build_services(&config).await?);
    let monitor = services.spawn_health_monitor(&config);
    let app = finadvisor_api::app::build_app(services.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    monitor.shutdown().await;
    services.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; shutdown signal disabled");
        std::future::pending::<()>().await;
    }
}
