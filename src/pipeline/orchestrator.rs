//! Flow orchestrator
//!
//! Turns one order into a job graph: a parent job on the pipeline queue gated
//! on two concurrent children (payment and inventory). The graph is submitted
//! atomically; correlation entries are recorded at submission time so the
//! reconciliation layer can resolve lifecycle events back to orders.

use crate::broker::{
    Backoff, Broker, ChildSpec, Deduplication, FlowProducer, FlowSpec, JobId, JobOptions,
    RevokeOutcome,
};
use crate::config::PipelineConfig;
use crate::error::AppError;
use crate::pipeline::stages::{Stage, PIPELINE_QUEUE};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Client-supplied order payload. All fields are optional; defaults produce a
/// demo order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderPayload {
    /// Order amount
    pub amount: Option<u64>,
    /// Line items
    pub items: Option<Vec<LineItem>>,
    /// Customer contact
    pub customer: Option<Customer>,
    /// Stage simulation overrides (e.g. force a payment decline), passed
    /// through to the stage processors
    pub simulate: Option<serde_json::Value>,
}

/// One line item of an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItem {
    /// Stock-keeping unit
    pub sku: String,
    /// Quantity ordered
    pub qty: u32,
}

/// Customer contact details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    /// Contact email
    pub email: String,
}

/// Reference to a child job created at submission.
#[derive(Debug, Clone, Serialize)]
pub struct ChildRef {
    /// Queue the child was submitted to
    pub queue: String,
    /// Child job identifier
    #[serde(rename = "jobId")]
    pub job_id: JobId,
}

/// Result of a successful order submission.
#[derive(Debug, Clone)]
pub struct OrderSubmission {
    /// Generated order identifier
    pub order_id: String,
    /// Parent pipeline job identifier
    pub parent_job_id: JobId,
    /// The two children (payment, inventory)
    pub children: Vec<ChildRef>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Serialize)]
pub struct CancelResult {
    /// The job the revoke was applied to
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    /// Revoke outcome ("revoked", "too_late", "not_found")
    pub result: String,
}

/// Correlation entries recorded at submission time: broker job id -> order id,
/// plus the payment child for each order so cancellation can find it.
///
/// This is the process-wide source of truth observers copy from; each
/// observer's reconciliation engine owns its own table (see
/// [`crate::reconcile::CorrelationTable`]).
#[derive(Clone, Default)]
pub struct SubmissionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    order_by_job: HashMap<JobId, String>,
    payment_job_by_order: HashMap<String, JobId>,
}

impl SubmissionRegistry {
    /// Record a job -> order correlation.
    pub fn record(&self, job_id: &JobId, order_id: &str) {
        let mut inner = self.inner.write().expect("registry lock");
        inner.order_by_job.insert(job_id.clone(), order_id.to_string());
    }

    /// Record which job is an order's payment child.
    pub fn record_payment_child(&self, order_id: &str, job_id: &JobId) {
        let mut inner = self.inner.write().expect("registry lock");
        inner
            .payment_job_by_order
            .insert(order_id.to_string(), job_id.clone());
    }

    /// Resolve a job id to its order id, copying the value out.
    pub fn order_for(&self, job_id: &JobId) -> Option<String> {
        let inner = self.inner.read().expect("registry lock");
        inner.order_by_job.get(job_id).cloned()
    }

    /// The payment child job for an order, if one was recorded.
    pub fn payment_job_for(&self, order_id: &str) -> Option<JobId> {
        let inner = self.inner.read().expect("registry lock");
        inner.payment_job_by_order.get(order_id).cloned()
    }
}

/// Builds and submits the order job graph; exposes best-effort cancellation.
#[derive(Clone)]
pub struct FlowOrchestrator {
    broker: Broker,
    flow: FlowProducer,
    registry: SubmissionRegistry,
    config: PipelineConfig,
}

impl FlowOrchestrator {
    /// Create an orchestrator over the broker's queues.
    pub fn new(broker: Broker, registry: SubmissionRegistry, config: PipelineConfig) -> Self {
        let flow = FlowProducer::new(broker.clone());
        Self {
            broker,
            flow,
            registry,
            config,
        }
    }

    /// The submission registry this orchestrator records into.
    pub fn registry(&self) -> &SubmissionRegistry {
        &self.registry
    }

    /// Submit an order.
    ///
    /// Builds the parent pipeline job with two concurrent children: a payment
    /// job with bounded retry, exponential backoff, a hard timeout and
    /// dead-letter routing on exhaustion; and an inventory job deduplicated
    /// on the order id so a duplicate submission cannot double-reserve stock.
    /// Either the full graph is accepted or the call fails with no partial
    /// graph left behind.
    pub fn submit(&self, payload: OrderPayload) -> Result<OrderSubmission, AppError> {
        let order_id = generate_order_id();
        let data = self.order_data(&order_id, payload);

        let handle = self.flow.add(FlowSpec {
            name: "process-order".to_string(),
            queue: PIPELINE_QUEUE.to_string(),
            data: data.clone(),
            children: vec![
                ChildSpec {
                    name: "charge-payment".to_string(),
                    queue: Stage::Payment.queue_name().to_string(),
                    data: data.clone(),
                    opts: JobOptions {
                        attempts: self.config.payment_attempts,
                        backoff: Some(Backoff::Exponential {
                            delay_ms: self.config.payment_backoff_base_ms,
                        }),
                        timeout_ms: Some(self.config.payment_timeout_ms),
                        ..Default::default()
                    },
                },
                ChildSpec {
                    name: "reserve-inventory".to_string(),
                    queue: Stage::Inventory.queue_name().to_string(),
                    data: data.clone(),
                    opts: JobOptions {
                        deduplication: Some(Deduplication {
                            id: order_id.clone(),
                        }),
                        ..Default::default()
                    },
                },
            ],
        })?;

        self.registry.record(&handle.parent.id, &order_id);
        for child in &handle.children {
            self.registry.record(&child.id, &order_id);
        }
        self.registry
            .record_payment_child(&order_id, &handle.children[0].id);

        info!(
            order_id = %order_id,
            parent_job_id = %handle.parent.id,
            "Order submitted"
        );

        Ok(OrderSubmission {
            order_id,
            parent_job_id: handle.parent.id.clone(),
            children: handle
                .children
                .iter()
                .map(|job| ChildRef {
                    queue: job.queue.clone(),
                    job_id: job.id.clone(),
                })
                .collect(),
        })
    }

    /// Best-effort cancellation.
    ///
    /// Accepts an order id or a job id; resolves to the order's payment-stage
    /// job and asks the queue to revoke it. A job already past its point of
    /// no return cannot be revoked; callers must treat that as "order may
    /// still complete".
    pub fn cancel(&self, id: &str) -> Result<CancelResult, AppError> {
        let job_id = self
            .registry
            .payment_job_for(id)
            .unwrap_or_else(|| id.to_string());

        let outcome = self
            .broker
            .revoke(Stage::Payment.queue_name(), &job_id);
        if outcome == RevokeOutcome::NotFound && self.registry.order_for(&job_id).is_none() {
            return Err(AppError::OrderNotFound(id.to_string()));
        }

        info!(job_id = %job_id, outcome = outcome.as_str(), "Cancellation requested");
        Ok(CancelResult {
            job_id,
            result: outcome.as_str().to_string(),
        })
    }

    fn order_data(&self, order_id: &str, payload: OrderPayload) -> serde_json::Value {
        let amount = payload.amount.unwrap_or_else(|| 10 + entropy() % 500);
        let items = payload.items.unwrap_or_else(|| {
            vec![LineItem {
                sku: "WIDGET-001".to_string(),
                qty: 1,
            }]
        });
        let customer = payload.customer.unwrap_or(Customer {
            email: "demo@example.com".to_string(),
        });

        let mut data = serde_json::json!({
            "orderId": order_id,
            "amount": amount,
            "items": items,
            "customer": customer,
        });
        if let Some(simulate) = payload.simulate {
            data["simulate"] = simulate;
        }
        data
    }
}

/// Fresh globally-unique order identifier.
fn generate_order_id() -> String {
    let frag = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "ord_{}_{}",
        chrono::Utc::now().timestamp_millis(),
        &frag[..6]
    )
}

fn entropy() -> u64 {
    // uuid v4 is backed by the OS RNG; enough for demo amounts
    (uuid::Uuid::new_v4().as_u128() % u128::from(u64::MAX)) as u64
}
