//! Order endpoints
//!
//! Submission, cancellation, and the recent-order listing. Handlers are thin:
//! all pipeline behavior lives in the orchestrator.

use crate::error::AppError;
use crate::pipeline::{CancelResult, OrderPayload, Stage};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

/// Cap on the order-history listing.
const ORDER_HISTORY_LIMIT: usize = 50;

/// One row of the recent-order listing: a finished payment job resolved back
/// to its order.
#[derive(Debug, Serialize)]
pub struct OrderHistoryEntry {
    /// Payment job identifier
    pub id: String,
    /// Order the job belonged to
    #[serde(rename = "orderId")]
    pub order_id: String,
    /// "completed" or "failed"
    pub status: String,
    /// Return value (completed jobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Failure reason (failed jobs)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the job finished, milliseconds since the epoch
    pub timestamp: i64,
}

/// `POST /orders`: submit an order through the flow orchestrator.
///
/// The body is optional; an absent or empty payload produces a demo order.
pub async fn create_order(
    State(state): State<Arc<AppState>>,
    payload: Option<Json<OrderPayload>>,
) -> Result<impl IntoResponse, AppError> {
    let payload = payload.map(|Json(p)| p).unwrap_or_default();
    let submission = state.orchestrator.submit(payload)?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "orderId": submission.order_id,
            "jobId": submission.parent_job_id,
            "status": "created",
            "children": submission.children,
        })),
    ))
}

/// `DELETE /orders/{id}`: best-effort cancellation by order id or job id.
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelResult>, AppError> {
    Ok(Json(state.orchestrator.cancel(&id)?))
}

/// `GET /orders`: recently finished payment jobs as a JSON array, newest
/// first.
pub async fn list_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<OrderHistoryEntry>>, AppError> {
    let queue = state
        .broker
        .queue(Stage::Payment.queue_name())
        .ok_or_else(|| AppError::QueueNotFound(Stage::Payment.queue_name().to_string()))?;

    let mut entries: Vec<OrderHistoryEntry> = Vec::new();
    for job in queue
        .get_jobs(crate::broker::JobState::Completed, ORDER_HISTORY_LIMIT)
        .into_iter()
        .chain(queue.get_jobs(crate::broker::JobState::Failed, ORDER_HISTORY_LIMIT))
    {
        let order_id = job
            .data
            .get("orderId")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let status = if job.state == crate::broker::JobState::Completed {
            "completed"
        } else {
            "failed"
        };
        entries.push(OrderHistoryEntry {
            id: job.id,
            order_id,
            status: status.to_string(),
            result: job.return_value,
            reason: job.failed_reason,
            timestamp: job.finished_on.unwrap_or(job.timestamp),
        });
    }
    entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
    entries.truncate(ORDER_HISTORY_LIMIT);

    Ok(Json(entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn quiet_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.pipeline.payment_decline_rate = 0;
        AppState::new(config)
    }

    #[tokio::test]
    async fn test_create_order_returns_graph_refs() {
        let state = quiet_state();
        let response = create_order(State(state.clone()), None).await.unwrap();
        let response = response.into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        state.shutdown_workers();
    }

    #[tokio::test]
    async fn test_cancel_unknown_order_is_404() {
        let state = quiet_state();
        let err = cancel_order(State(state.clone()), Path("ord_missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::OrderNotFound(_)));
        state.shutdown_workers();
    }

    #[tokio::test]
    async fn test_cancel_known_order_reports_outcome() {
        let state = quiet_state();
        state.shutdown_workers(); // keep the payment job unclaimed

        let submission = state.orchestrator.submit(OrderPayload::default()).unwrap();
        let Json(result) = cancel_order(State(state.clone()), Path(submission.order_id))
            .await
            .unwrap();
        assert_eq!(result.result, "revoked");
    }

    #[tokio::test]
    async fn test_list_orders_empty_is_bare_array() {
        let state = quiet_state();
        let Json(orders) = list_orders(State(state.clone())).await.unwrap();
        assert!(orders.is_empty());
        let wire = serde_json::to_value(&orders).unwrap();
        assert!(wire.is_array());
        state.shutdown_workers();
    }
}
