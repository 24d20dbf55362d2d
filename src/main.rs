use dotenv::dotenv;
use relay_server::{health_server, AppState, Settings, WsListener};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[actix_web::main]
async fn main() -> relay_server::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Load configuration
    let config = Settings::new()?;
    init_tracing(&config.log.level);
    info!(environment = %config.environment, "Configuration loaded successfully");

    let state = AppState::new(config.clone());

    let health = if config.health.enabled {
        let server = health_server(state.clone())?;
        let handle = server.handle();
        actix_web::rt::spawn(server);
        info!("Health endpoint available at http://{}:{}/health", config.health.host, config.health.port);
        Some(handle)
    } else {
        None
    };

    let listener = WsListener::bind_with_timeout(
        (config.server.host.as_str(), config.server.port),
        config.server.handshake_timeout(),
    )
    .await?;
    info!("Relay server ready to accept connections at ws://{}", listener.local_addr());

    state.engine.clone().run(listener, shutdown_signal()).await;

    if let Some(handle) = health {
        handle.stop(true).await;
    }

    info!("Shutdown complete");
    Ok(())
}
