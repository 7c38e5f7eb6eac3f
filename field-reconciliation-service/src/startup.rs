//! Application startup and lifecycle management.

use crate::config::ReconciliationConfig;
use crate::error::ReconciliationError;
use crate::feeds::{BooksClient, BooksSource, FieldOpsClient, FieldOpsSource};
use crate::handlers::{self, reconciliation};
use crate::matching::MatchingEngine;
use crate::services::{init_metrics, Database, MemoryStore, ReconciliationStore, SyncOrchestrator};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ReconciliationConfig>,
    pub store: Arc<dyn ReconciliationStore>,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(
        config: ReconciliationConfig,
        store: Arc<dyn ReconciliationStore>,
        field_ops: Arc<dyn FieldOpsSource>,
        books: Arc<dyn BooksSource>,
    ) -> Self {
        let orchestrator = SyncOrchestrator::new(
            store.clone(),
            field_ops,
            books,
            MatchingEngine::new(config.matching),
            config.sync.clone(),
        );
        Self {
            config: Arc::new(config),
            store,
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// HTTP routes for the service.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/reconciliation/sync", post(reconciliation::run_sync))
        .route("/reconciliation/sync-logs", get(reconciliation::list_sync_logs))
        .route("/reconciliation/records", get(reconciliation::list_records))
        .route("/reconciliation/records/:id", get(reconciliation::get_record))
        .route(
            "/reconciliation/records/:id/candidates",
            get(reconciliation::list_candidates),
        )
        .route(
            "/reconciliation/records/:id/manual-match",
            post(reconciliation::manual_match),
        )
        .route(
            "/reconciliation/records/:id/books-match",
            post(reconciliation::books_match),
        )
        .route(
            "/reconciliation/records/:id/discrepancy",
            post(reconciliation::mark_discrepancy),
        )
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

/// Periodic passes sharing the orchestrator's single-pass guard.
pub fn spawn_scheduler(orchestrator: Arc<SyncOrchestrator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so startup is not a pass.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match orchestrator.run_reconciliation_sync().await {
                Ok(summary) => tracing::info!(
                    sync_id = %summary.sync_id,
                    succeeded = summary.succeeded(),
                    "Scheduled reconciliation pass finished"
                ),
                Err(ReconciliationError::PassInProgress) => {
                    tracing::info!("Scheduled pass skipped, another pass is running")
                }
                Err(e) => tracing::error!(error = %e, "Scheduled reconciliation pass failed"),
            }
        }
    })
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, true).await
    }

    /// Build the application without running migrations.
    /// Use this in tests when migrations are already applied by the test harness.
    pub async fn build_without_migrations(config: ReconciliationConfig) -> Result<Self, AppError> {
        Self::build_internal(config, false).await
    }

    async fn build_internal(
        config: ReconciliationConfig,
        run_migrations: bool,
    ) -> Result<Self, AppError> {
        init_metrics();

        let store: Arc<dyn ReconciliationStore> = match &config.database {
            Some(database) => {
                let db = Database::new(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!(error = %e, "Failed to connect to PostgreSQL");
                    AppError::from(e)
                })?;

                if run_migrations {
                    db.run_migrations().await.map_err(|e| {
                        tracing::error!(error = %e, "Failed to run migrations");
                        AppError::from(e)
                    })?;
                }
                Arc::new(db)
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using in-memory store, data is not persisted");
                Arc::new(MemoryStore::new())
            }
        };

        let field_ops = FieldOpsClient::new(config.field_ops.clone())?;
        if !field_ops.is_configured() {
            tracing::warn!("Field ops credentials not configured - passes will fail until set");
        }
        let books = BooksClient::new(config.books.clone())?;
        if !books.is_configured() {
            tracing::warn!("Books credentials not configured - passes will fail until set");
        }

        let state = AppState::new(config, store, Arc::new(field_ops), Arc::new(books));
        Self::with_state(state).await
    }

    /// Bind a listener for an already assembled state.
    pub async fn with_state(state: AppState) -> Result<Self, AppError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], state.config.common.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Field reconciliation service listener bound");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Run the application until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let scheduler = self.state.config.sync.interval.map(|interval| {
            tracing::info!(interval_secs = interval.as_secs(), "Starting reconciliation scheduler");
            spawn_scheduler(self.state.orchestrator.clone(), interval)
        });

        let app = router(self.state);
        tracing::info!(port = self.port, "HTTP server listening");
        let result = axum::serve(self.listener, app).await;

        if let Some(handle) = scheduler {
            handle.abort();
        }
        result
    }
}
