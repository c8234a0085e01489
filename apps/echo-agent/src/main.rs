use anyhow::Result;
use axum::serve;
use tokio::net::TcpListener;
use tracing::info;

use echo_agent::build_app;
use echo_agent::config::AppConfig;

#[tokio::main]
async fn main() -> Result<()> {
    agents_telemetry::install("echo-agent")?;

    let config = AppConfig::from_env()?;
    let router = build_app(&config)?;
    let listener = TcpListener::bind(config.addr).await?;
    info!("echo-agent listening on {}", config.addr);

    serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    Ok(())
}
