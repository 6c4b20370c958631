use axum::{
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::api::state::{AppState, ExecutorState};
use crate::config::CacheConfig;
use crate::error::PlaygroundError;
use crate::executor::{ArtifactStore, CleanupReport};

pub struct WebServer {
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    /// Runs the playground backend until SIGINT/SIGTERM. The artifact
    /// sweeper runs alongside and stops with the server.
    pub async fn start(&self, state: AppState, cache: &CacheConfig) -> Result<(), PlaygroundError> {
        let app = create_router(state.clone());
        let addr = self.addr()?;

        println!("🚀 Playground backend starting on http://{}", addr);

        // Create shutdown channel for background tasks
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let sweeper = ArtifactSweeper::new(
            state.gateway.csharp().store().clone(),
            cache.cleanup_interval(),
            cache.max_age(),
            cache.max_size,
        );
        let sweeper_handle = sweeper.spawn(shutdown_tx.subscribe());

        serve(addr, app, shutdown_tx).await?;

        if let Err(e) = sweeper_handle.await {
            log::warn!("Artifact sweeper ended abnormally: {}", e);
        }
        Ok(())
    }

    /// Runs the stand-alone C# execution service.
    pub async fn start_executor_service(&self, state: ExecutorState) -> Result<(), PlaygroundError> {
        let app = create_executor_router(state);
        let addr = self.addr()?;

        println!("🚀 C# execution service starting on http://{}", addr);

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        serve(addr, app, shutdown_tx).await
    }

    fn addr(&self) -> Result<SocketAddr, PlaygroundError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| PlaygroundError::Error(format!("Invalid address: {}", e)))
    }
}

async fn serve(
    addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), PlaygroundError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| PlaygroundError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

    log::info!("Server ready to handle requests on {}", addr);

    // Start the server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            log::info!("Shutdown signal received, stopping background tasks...");
            println!("\n🛑 Shutdown signal received - stopping server gracefully...");

            // Signal background tasks to stop
            let _ = shutdown_tx.send(());

            log::info!("Server shutdown complete");
            println!("   Server stopped");
        })
        .await
        .map_err(|e| PlaygroundError::Error(format!("Server error: {}", e)))?;

    Ok(())
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health_check))

        // Execution endpoints
        .route("/api/execute-sql", post(api::execute::execute_sql))
        .route("/api/execute-javascript", post(api::execute::execute_javascript))
        .route("/api/execute-csharp", post(api::execute::execute_csharp))
        .route("/api/execute", post(api::execute::execute))

        // Database endpoints
        .route("/api/schema", get(api::schema::get_schema))
        .route("/api/migrations", get(api::schema::get_migrations))

        // Add state for handlers
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub fn create_executor_router(state: ExecutorState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/execute", post(api::executor_service::execute))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        timestamp: Utc::now(),
    })
}

/// Periodic eviction of old C# artifacts.
pub struct ArtifactSweeper {
    store: ArtifactStore,
    interval: Duration,
    max_age: Duration,
    max_size: usize,
}

impl ArtifactSweeper {
    pub fn new(store: ArtifactStore, interval: Duration, max_age: Duration, max_size: usize) -> Self {
        Self {
            store,
            interval,
            max_age,
            max_size,
        }
    }

    pub async fn sweep_once(&self) -> Result<CleanupReport, PlaygroundError> {
        let store = self.store.clone();
        let (max_age, max_size) = (self.max_age, self.max_size);
        tokio::task::spawn_blocking(move || store.cleanup(max_age, max_size)).await?
    }

    /// Sweeps on every tick, the first one immediately, until shutdown is
    /// broadcast.
    pub fn spawn(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            println!(
                "   Starting artifact sweeper (every {} seconds)",
                self.interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match self.sweep_once().await {
                            Ok(report) => log::debug!(
                                "Artifact sweep: scanned {}, removed {}",
                                report.scanned, report.removed
                            ),
                            Err(e) => log::error!("Cache cleanup error: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        log::info!("Artifact sweeper shutting down gracefully");
                        break;
                    }
                }
            }
        })
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
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
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
