//! REST API.
//!
//! ## Endpoints
//!
//! - `GET /status` - liveness check, answers `OK`
//! - `GET /diagnose` - output of `barman diagnose`
//! - `GET|POST /servers/{server_name}/operations` - list or create server operations
//! - `GET /servers/{server_name}/operations/{operation_id}` - status of a server operation
//! - `GET|POST /operations` - list or create instance operations
//! - `GET /operations/{operation_id}` - status of an instance operation

mod error;
mod handlers;

pub use error::ApiError;

use axum::{Router, routing::get};
use tokio::sync::broadcast;

use crate::context::AppContext;
use crate::core::WorkerPool;

/// Shared state for the web server
#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
    pub pool: WorkerPool,
}

/// Build the API router.
pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route("/diagnose", get(handlers::diagnose))
        .route(
            "/servers/{server_name}/operations",
            get(handlers::list_server_operations).post(handlers::create_server_operation),
        )
        .route(
            "/servers/{server_name}/operations/{operation_id}",
            get(handlers::get_server_operation),
        )
        .route(
            "/operations",
            get(handlers::list_instance_operations).post(handlers::create_instance_operation),
        )
        .route(
            "/operations/{operation_id}",
            get(handlers::get_instance_operation),
        )
        .with_state(state)
}

/// HTTP server for the API.
pub struct WebServer {
    bind_addr: String,
    state: WebState,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, pool: WorkerPool) -> Self {
        let bind_addr = ctx.config.bind_addr();
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            state: WebState { ctx, pool },
            shutdown_tx,
        }
    }

    /// Start the web server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let app = router(self.state.clone());

        let listener = tokio::net::TcpListener::bind(&self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Postgres Backup API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
