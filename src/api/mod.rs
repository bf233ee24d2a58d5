//! API module
//!
//! HTTP request handlers for order submission, dashboards, and the
//! server-sent event stream.

pub mod dashboard;
pub mod events;
pub mod orders;

use axum::Json;
use serde_json::{json, Value};

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "orderflow-backend",
    }))
}
