//! Dispatch API for a rosie node.
//!
//! ## Endpoints
//!
//! - `GET /status` - node name, busy flag, and running job count
//! - `POST /run-test` - queue a test run for `{"commit_sha": ...}`
//! - `GET /jobs/{id}` - a queued job's state and, once done, its result
//!
//! `/run-test` only acknowledges acceptance. The run itself happens later on
//! whichever node agent claims the job.

mod error;
mod handlers;

use axum::{
    Router,
    routing::{get, post},
};
use std::net::SocketAddr;
use tokio::sync::broadcast;

use crate::context::AppContext;

pub use error::ApiError;

/// Shared state for the request handlers
#[derive(Clone)]
pub struct WebState {
    pub ctx: AppContext,
}

/// Build the API router.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/status", get(handlers::status))
        .route(
            "/run-test",
            post(handlers::run_test).fallback(handlers::method_not_allowed),
        )
        .route("/jobs/{id}", get(handlers::job))
        .with_state(WebState { ctx })
}

/// HTTP server for the dispatch API.
pub struct WebServer {
    bind_addr: SocketAddr,
    app: Router,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebServer {
    pub fn new(ctx: AppContext, bind_addr: SocketAddr) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            bind_addr,
            app: router(ctx),
            shutdown_tx,
        }
    }

    /// Start the server. Runs until shutdown() is called.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        tracing::info!(addr = %self.bind_addr, "Dispatch API listening");

        axum::serve(listener, self.app.clone())
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
