//! Orderflow Backend
//!
//! An order-fulfillment pipeline server: orders become job graphs on an
//! in-process broker, workers run the stages, and observers follow along over
//! a reconciled server-sent event stream.

use axum::{
    extract::Request,
    middleware::Next,
    response::Response,
    routing::{delete, get},
    Router,
};
use orderflow_backend::api;
use orderflow_backend::config::Config;
use orderflow_backend::pipeline::Stage;
use orderflow_backend::state::AppState;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

/// Request ID middleware - adds unique ID to each request for tracing
async fn request_id_middleware(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let span = info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    let response = next.run(request).instrument(span).await;

    let duration = start.elapsed();
    info!(
        request_id = %request_id,
        method = %method,
        uri = %uri,
        status = %response.status().as_u16(),
        duration_ms = duration.as_millis(),
        "Request completed"
    );

    response
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Configuration loaded: {:?}", config);

    // Build queues, start the worker fleet
    let app_state = AppState::new(config.clone());

    // Scheduled analytics report, in place of a cron job
    let report = app_state.broker.spawn_repeating(
        Stage::Analytics.queue_name(),
        "daily-report",
        json!({"orderId": "system", "eventType": "scheduled_report"}),
        Duration::from_secs(config.pipeline.report_interval_secs.max(1)),
    );

    // Build our application with routes
    let app = Router::new()
        .route("/health", get(api::health))
        // Order lifecycle
        .route(
            "/orders",
            get(api::orders::list_orders).post(api::orders::create_order),
        )
        .route("/orders/:id", delete(api::orders::cancel_order))
        // Dashboards
        .route("/dashboard", get(api::dashboard::queue_counts))
        .route("/dashboard/dlq", get(api::dashboard::dead_letter_entries))
        // Live event stream
        .route("/events", get(api::events::stream_events))
        // Middleware (order matters - request_id should be first)
        .layer(axum::middleware::from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                tracing::info_span!(
                    "http_request",
                    method = %request.method(),
                    uri = %request.uri(),
                )
            }),
        )
        .layer(CorsLayer::permissive()) // Allow CORS for development
        .with_state(app_state.clone());

    // Bind to address from config
    let addr: SocketAddr = config
        .server_addr()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid server address: {}", e))?;

    info!("🚀 Server running on http://{}", addr);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    // Setup graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(report) = report {
        report.abort();
    }
    app_state.shutdown_workers();
    info!("Server shutdown complete");
    Ok(())
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down gracefully...");
        },
    }
}
