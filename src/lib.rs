pub mod config;
pub mod error;
pub mod relay;
pub mod transport;

use std::sync::Arc;

use actix_web::{dev::Server, web, App, HttpResponse, HttpServer};

pub use config::Settings;
pub use error::{AppError, RelayError};
pub type Result<T> = std::result::Result<T, AppError>;

pub use relay::{RelayConfig, RelayEngine, ServerMessage};
pub use transport::ws::WsListener;

/// Health check endpoint handler
/// Returns a JSON response with server status, timestamp and relay counters
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": state.engine.connection_count().await,
        "stats": state.engine.stats(),
    }))
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub engine: Arc<RelayEngine>,
}

impl AppState {
    pub fn new(config: Settings) -> Self {
        let engine = RelayEngine::new(config.relay_config());
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
        }
    }
}

/// Builds the HTTP server exposing `/health`. Signal handling is left to the
/// caller, which stops it through the returned server's handle.
pub fn health_server(state: AppState) -> Result<Server> {
    let health = state.config.health.clone();
    let data = web::Data::new(state);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/health", web::get().to(health_check))
    })
    .workers(health.workers.max(1) as usize)
    .disable_signals()
    .bind((health.host.as_str(), health.port))?
    .run();

    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_creation() {
        let config = Settings::new_for_test().expect("Failed to load test config");
        let state = AppState::new(config);

        assert_eq!(
            state.engine.config().liveness_interval,
            std::time::Duration::from_secs(30)
        );
        assert_eq!(state.engine.config().max_missed_probes, 0);
    }

    #[test]
    fn test_app_state_clone() {
        let config = Settings::new_for_test().expect("Failed to load test config");
        let state = AppState::new(config);
        let cloned = state.clone();

        // Verify Arc references are shared
        assert!(Arc::ptr_eq(&state.config, &cloned.config));
        assert!(Arc::ptr_eq(&state.engine, &cloned.engine));
    }
}
