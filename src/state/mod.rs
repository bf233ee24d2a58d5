//! Shared application state
//!
//! Owns every long-lived service: the broker's queue set, the worker fleet,
//! the flow orchestrator, the submission registry, and the dead-letter view.
//! Built once at startup and shared with handlers as `Arc<AppState>`.

use crate::broker::{Broker, Processor, Queue, Worker, WorkerOptions};
use crate::config::Config;
use crate::pipeline::{
    ContinuationProcessor, DeadLetterRouter, FlowOrchestrator, Stage, SubmissionRegistry,
    DEAD_LETTER_QUEUE, PIPELINE_QUEUE,
};
use crate::pipeline::processors::{
    AnalyticsProcessor, InventoryProcessor, NotificationProcessor, PaymentProcessor,
    ShippingProcessor,
};
use std::sync::Arc;
use tracing::info;

/// Worker concurrency per stage queue.
const STAGE_CONCURRENCY: [(Stage, usize); 5] = [
    (Stage::Payment, 3),
    (Stage::Inventory, 3),
    (Stage::Shipping, 2),
    (Stage::Notification, 2),
    (Stage::Analytics, 5),
];

/// Worker concurrency for the parent pipeline queue.
const PIPELINE_CONCURRENCY: usize = 5;

/// Shared application state.
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// Queue registry
    pub broker: Broker,
    /// Order submission and cancellation
    pub orchestrator: FlowOrchestrator,
    /// Process-wide job -> order correlations
    pub registry: SubmissionRegistry,
    /// Read-only dead-letter view
    pub dead_letter: DeadLetterRouter,
    workers: Vec<Worker>,
}

impl AppState {
    /// Build the full queue topology and start the worker fleet.
    pub fn new(config: Config) -> Arc<Self> {
        let dlq = Queue::new(DEAD_LETTER_QUEUE);
        let mut queues = vec![Queue::new(PIPELINE_QUEUE), dlq.clone()];
        for stage in Stage::ALL {
            let queue = Queue::new(stage.queue_name());
            // Only payment exhaustion dead-letters; other stages fail in place
            if stage == Stage::Payment {
                queues.push(queue.with_dead_letter(dlq.clone()));
            } else {
                queues.push(queue);
            }
        }
        let broker = Broker::new(queues);

        let registry = SubmissionRegistry::default();
        let orchestrator = FlowOrchestrator::new(
            broker.clone(),
            registry.clone(),
            config.pipeline.clone(),
        );
        let dead_letter = DeadLetterRouter::new(
            broker
                .queue(DEAD_LETTER_QUEUE)
                .unwrap_or_else(|| Queue::new(DEAD_LETTER_QUEUE)),
        );

        let mut workers = Vec::new();
        for (stage, concurrency) in STAGE_CONCURRENCY {
            let processor: Arc<dyn Processor> = match stage {
                Stage::Payment => Arc::new(PaymentProcessor {
                    decline_rate: config.pipeline.payment_decline_rate,
                }),
                Stage::Inventory => Arc::new(InventoryProcessor),
                Stage::Shipping => Arc::new(ShippingProcessor),
                Stage::Notification => Arc::new(NotificationProcessor),
                Stage::Analytics => Arc::new(AnalyticsProcessor),
            };
            if let Some(queue) = broker.queue(stage.queue_name()) {
                workers.push(Worker::start(
                    queue,
                    broker.clone(),
                    processor,
                    WorkerOptions { concurrency },
                ));
            }
        }
        if let Some(queue) = broker.queue(PIPELINE_QUEUE) {
            workers.push(Worker::start(
                queue,
                broker.clone(),
                Arc::new(ContinuationProcessor::new(
                    broker.clone(),
                    registry.clone(),
                    config.pipeline.clone(),
                )),
                WorkerOptions {
                    concurrency: PIPELINE_CONCURRENCY,
                },
            ));
        }
        info!(workers = workers.len(), "Pipeline workers started");

        Arc::new(Self {
            config,
            broker,
            orchestrator,
            registry,
            dead_letter,
            workers,
        })
    }

    /// Stop all worker dispatch loops. In-flight attempts finish on their own.
    pub fn shutdown_workers(&self) {
        for worker in &self.workers {
            worker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::JobState;
    use crate::pipeline::OrderPayload;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_state_builds_full_topology() {
        let state = AppState::new(Config::default());
        assert_eq!(state.broker.queues().count(), 7);
        assert!(state.broker.queue(PIPELINE_QUEUE).is_some());
        assert!(state.broker.queue(DEAD_LETTER_QUEUE).is_some());
        assert_eq!(state.workers.len(), 6);
        state.shutdown_workers();
    }

    #[tokio::test]
    async fn test_end_to_end_fulfillment() {
        let mut config = Config::default();
        config.pipeline.payment_decline_rate = 0;
        let state = AppState::new(config);

        let payload: OrderPayload = serde_json::from_value(json!({
            "amount": 99,
            "items": [{"sku": "WIDGET-001", "qty": 2}],
            "customer": {"email": "buyer@example.com"},
            "simulate": {"payment": "approve"}
        }))
        .unwrap();
        let submission = state.orchestrator.submit(payload).unwrap();
        assert_eq!(submission.children.len(), 2);

        // The whole chain (parent gate, continuation, shipping, analytics)
        // should run to completion; notification is delayed so we stop at
        // shipping.
        let shipping = state.broker.queue("shipping").unwrap();
        let mut done = false;
        for _ in 0..400 {
            if !shipping.get_jobs(JobState::Completed, 10).is_empty() {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert!(done, "shipping never completed");
        state.shutdown_workers();
    }

    #[tokio::test]
    async fn test_forced_decline_reaches_dead_letter() {
        let mut config = Config::default();
        config.pipeline.payment_backoff_base_ms = 1;
        let state = AppState::new(config);

        let payload: OrderPayload = serde_json::from_value(json!({
            "simulate": {"payment": "decline"}
        }))
        .unwrap();
        state.orchestrator.submit(payload).unwrap();

        let mut entries = Vec::new();
        for _ in 0..400 {
            entries = state.dead_letter.list_entries(10);
            if !entries.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].queue_of_origin, "payment");
        assert_eq!(entries[0].attempts_made, 3);
        state.shutdown_workers();
    }
}
