//! flowgate-api — the API/UI server role.
//!
//! Serves the workflow REST API over the shared metadata store, plus a
//! liveness endpoint the supervisor probes.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health` | Liveness, with metadatabase and scheduler status |
//! | GET | `/api/v1/version` | Version and executor |
//! | GET | `/api/v1/workflows` | List workflow definitions |
//! | GET | `/api/v1/workflows/{id}` | Get one definition |
//! | PATCH | `/api/v1/workflows/{id}` | Pause or unpause |
//! | GET | `/api/v1/workflows/{id}/runs` | List runs of a workflow |

pub mod error;
pub mod handlers;

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use flowgate_core::{ExecutorMode, Settings};
use flowgate_store::{MetaStore, StoreError};

pub use error::{ApiError, ApiResult};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: MetaStore,
    /// Example workflows are hidden when false.
    pub load_examples: bool,
    pub executor: ExecutorMode,
    /// A scheduler heartbeat older than this reports unhealthy.
    pub heartbeat_timeout: Duration,
}

impl ApiState {
    pub fn new(store: MetaStore, settings: &Settings) -> Self {
        Self {
            store,
            load_examples: settings.core.load_examples,
            executor: settings.core.executor,
            heartbeat_timeout: settings.scheduler.heartbeat_timeout,
        }
    }
}

/// Build the complete router.
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route("/version", get(handlers::version))
        .route("/workflows", get(handlers::list_workflows))
        .route(
            "/workflows/{id}",
            get(handlers::get_workflow).patch(handlers::patch_workflow),
        )
        .route("/workflows/{id}/runs", get(handlers::list_runs))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health).with_state(state))
}

/// Bind the configured address.
pub async fn bind(settings: &Settings) -> ApiResult<TcpListener> {
    let addr = settings.webserver.bind_addr();
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ApiError::Bind { addr, source })
}

/// Serve until `shutdown` flips to true.
///
/// Refuses to start unless the schema is at the latest version, so the API
/// never observes a half-migrated store.
pub async fn serve(
    listener: TcpListener,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> ApiResult<()> {
    let version = state.store.ensure_schema_current().await.map_err(|e| match e {
        StoreError::SchemaNotMigrated(msg) => ApiError::SchemaNotReady(msg),
        other => ApiError::Store(other),
    })?;

    let addr = listener.local_addr()?;
    info!(%addr, schema_version = version, "API server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
            info!("API server shutting down");
        })
        .await?;
    Ok(())
}
