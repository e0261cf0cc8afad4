use anyhow::Context;

use clipforge_api::app::{self, runtime::{Adapters, Providers, Runtime}};
use clipforge_infra::config::AppConfig;
use clipforge_observability::LogConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clipforge_observability::tracing::init_with(&LogConfig::from_env());

    let config = AppConfig::from_env().context("invalid configuration")?;
    let adapters = Adapters::from_config(&config).await?;
    let providers = Providers::http(&config.provider)?;

    // Recovery runs inside start, before the listener accepts anything.
    let runtime = Runtime::start(&config, adapters, providers).await?;
    let app = app::build_app(runtime.services());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
