use coinpay_backend::{api, config, ledger, payments, telemetry};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration
    let config = config::Config::from_env()?;

    telemetry::init_tracing(config.server.log_format)?;

    tracing::info!("Starting coin payment backend");
    tracing::info!("Environment: {}", config.server.environment);
    tracing::info!("Ledger backend: {}", config.ledger.backend);

    let providers = payments::providers::build_registry(&config.providers)?;
    let store = ledger::open_store(&config.ledger).await?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let app = api::build_router(api::AppState::new(config, providers, store))?;

    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
