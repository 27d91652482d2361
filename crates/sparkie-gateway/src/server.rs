//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use sparkie_core::config::{GatewayConfig, SparkieConfig};
use sparkie_scheduler::{OutreachTrigger, SchedulerDb, TaskExecutor, WorklogWriter};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<SchedulerDb>,
    /// Runs the caller's due tasks inline before deciding on outreach.
    pub outreach: Arc<OutreachTrigger>,
    pub worklog: WorklogWriter,
    /// Applied when a new cron task's first fire time is computed.
    pub cron_offset_minutes: i32,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(executor: Arc<TaskExecutor>, config: &SparkieConfig) -> Self {
        let db = executor.db().clone();
        Self {
            worklog: executor.worklog().clone(),
            outreach: Arc::new(OutreachTrigger::new(executor, config.outreach.clone())),
            db,
            cron_offset_minutes: config.scheduler.cron_utc_offset_minutes,
            start_time: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        .route(
            "/api/tasks",
            get(super::routes::list_tasks)
                .post(super::routes::create_task)
                .patch(super::routes::resolve_task),
        )
        .route("/api/tasks/{id}", get(super::routes::get_task))
        // Proactive outreach poll
        .route("/api/agent", post(super::routes::poll_outreach))
        .route(
            "/api/worklog",
            get(super::routes::list_worklog).post(super::routes::append_worklog),
        )
        .route("/api/activity", post(super::routes::record_activity));

    let public = Router::new().route("/health", get(super::routes::health_check));

    api.merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PATCH,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: SPARKIE_CORS_ORIGINS=https://studio.example.com,https://app.example.com
            if let Ok(origins_str) = std::env::var("SPARKIE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Bind and serve until `shutdown` resolves.
pub async fn start(
    config: &GatewayConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
