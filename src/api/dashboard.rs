//! Dashboard endpoints
//!
//! Point-in-time queue counts and the dead-letter listing. Both are snapshot
//! reads; live state belongs to the event stream.

use crate::error::AppError;
use crate::pipeline::{all_queue_names, DeadLetterEntry};
use crate::state::AppState;
use axum::{extract::State, Json};
use serde_json::Value;
use std::sync::Arc;

/// Cap on the dead-letter listing.
const DLQ_LIMIT: usize = 100;

/// `GET /dashboard`: a flat `{queueName: counts}` map, in display order.
pub async fn queue_counts(State(state): State<Arc<AppState>>) -> Result<Json<Value>, AppError> {
    let mut queues = serde_json::Map::new();
    for name in all_queue_names() {
        if let Some(queue) = state.broker.queue(name) {
            let counts = serde_json::to_value(queue.counts()).map_err(anyhow::Error::from)?;
            queues.insert(name.to_string(), counts);
        }
    }

    Ok(Json(Value::Object(queues)))
}

/// `GET /dashboard/dlq`: the dead-lettered jobs as a JSON array, newest first.
pub async fn dead_letter_entries(
    State(state): State<Arc<AppState>>,
) -> Json<Vec<DeadLetterEntry>> {
    Json(state.dead_letter.list_entries(DLQ_LIMIT))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::pipeline::OrderPayload;
    use std::time::Duration;

    #[tokio::test]
    async fn test_queue_counts_is_flat_map_of_every_queue() {
        let state = AppState::new(Config::default());
        let Json(value) = queue_counts(State(state.clone())).await.unwrap();

        let queues = value.as_object().unwrap();
        assert_eq!(queues.len(), 7);
        assert_eq!(queues["payment"]["waiting"], 0);
        assert_eq!(queues["dead-letter"]["completed"], 0);
        state.shutdown_workers();
    }

    #[tokio::test]
    async fn test_dead_letter_listing_after_exhaustion() {
        let mut config = Config::default();
        config.pipeline.payment_backoff_base_ms = 1;
        let state = AppState::new(config);

        let payload: OrderPayload =
            serde_json::from_value(serde_json::json!({"simulate": {"payment": "decline"}}))
                .unwrap();
        state.orchestrator.submit(payload).unwrap();

        let mut entries = Vec::new();
        for _ in 0..400 {
            let Json(listed) = dead_letter_entries(State(state.clone())).await;
            entries = listed;
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].queue_of_origin, "payment");
        state.shutdown_workers();
    }
}
