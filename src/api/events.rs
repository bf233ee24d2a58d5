//! Server-sent event stream
//!
//! One SSE connection per observer. The connection owns its own event relay
//! (one broadcast subscription per queue) and its own reconciliation engine;
//! nothing about a connection is shared, so teardown on disconnect is just
//! dropping the stream.

use crate::error::AppError;
use crate::pipeline::SubmissionRegistry;
use crate::reconcile::ReconciliationEngine;
use crate::relay::{EventRelay, RelayedEvent};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::State,
    http::{header, StatusCode},
    response::Response,
};
use futures_util::stream::Stream;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// `GET /events`: the live event stream.
///
/// Emits an initial `{"type":"connected"}` marker, then one JSON object per
/// lifecycle event, with comment-only heartbeat lines on an independent
/// interval to keep intermediaries from closing idle connections. Events that
/// resolve to a known order are enriched with `orderId` and `orderStatus`.
pub async fn stream_events(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let relay = EventRelay::new(&state.broker);
    let engine = ReconciliationEngine::new(state.config.pipeline.payment_attempts);
    let registry = state.registry.clone();
    let heartbeat = Duration::from_secs(state.config.events.heartbeat_secs.max(1));

    let stream = create_stream(relay, engine, registry, heartbeat);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Failed to build SSE response: {}", e)))
}

/// The per-connection frame stream. Owns the relay and engine; dropping the
/// stream drops both, tearing down every queue subscription.
fn create_stream(
    mut relay: EventRelay,
    mut engine: ReconciliationEngine,
    registry: SubmissionRegistry,
    heartbeat: Duration,
) -> impl Stream<Item = Result<String, std::io::Error>> {
    async_stream::stream! {
        yield Ok("data: {\"type\":\"connected\"}\n\n".to_string());

        let mut ticker = tokio::time::interval(heartbeat);
        ticker.tick().await; // the first tick fires immediately
        loop {
            tokio::select! {
                relayed = relay.next_event() => {
                    match relayed {
                        Some(relayed) => yield Ok(render_event(&mut engine, &registry, relayed)),
                        // every queue's sending half is gone; the server is
                        // shutting down
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    engine.prune_completed();
                    yield Ok(": heartbeat\n\n".to_string());
                }
            }
        }
    }
}

/// Reconcile one relayed event and format it as an SSE frame.
///
/// Correlations are copied from the process-wide registry on first sight of a
/// job id, so the engine stays owned by this connection. Events that resolve
/// to no order (scheduled reports, stale jobs) are forwarded unenriched.
fn render_event(
    engine: &mut ReconciliationEngine,
    registry: &SubmissionRegistry,
    relayed: RelayedEvent,
) -> String {
    if !engine.knows_job(&relayed.event.job_id) {
        if let Some(order_id) = registry.order_for(&relayed.event.job_id) {
            engine.register(&relayed.event.job_id, &order_id);
        }
    }

    let resolved = engine
        .apply(&relayed.queue, &relayed.event)
        .map(|order| (order.order_id.clone(), order.status));

    let mut value = serde_json::to_value(&relayed).unwrap_or(Value::Null);
    if let (Some((order_id, status)), Some(obj)) = (resolved, value.as_object_mut()) {
        obj.insert("orderId".to_string(), Value::String(order_id));
        obj.insert(
            "orderStatus".to_string(),
            serde_json::to_value(status).unwrap_or(Value::Null),
        );
    }
    format!("data: {}\n\n", value)
}
