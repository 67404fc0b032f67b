use std::path::PathBuf;

use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use cadenza_agent::api::HttpCiApi;
use cadenza_agent::config::Config;
use cadenza_agent::error::AgentError;
use cadenza_agent::Agent;

#[tokio::main]
async fn main() -> Result<(), AgentError> {
    let config = match std::env::var("CADENZA_AGENT_CONFIG") {
        Ok(path) => Config::from_file(&PathBuf::from(path))?,
        Err(_) => Config::default(),
    };

    // RUST_LOG wins over the configured level when set.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .init();

    info!("Starting cadenza-agent");
    info!("API: {}", config.api_base_url);
    match &config.worker_path {
        Some(path) => info!("Worker: {}", path.display()),
        None => info!("Worker: none configured, using nix-store --realise"),
    }

    let api = HttpCiApi::new(&config.api_base_url, config.api_token.clone())?;
    let agent = Agent::new(config, api);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await?;

    info!("cadenza-agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
