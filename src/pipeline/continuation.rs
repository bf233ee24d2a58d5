//! Continuation worker for the parent pipeline job
//!
//! Runs once the two children (payment, inventory) have both completed, and
//! submits the fulfillment chain: shipping, then notification (delayed so it
//! logically follows shipping), then analytics. Each chain stage is an
//! independently-scheduled job so it can be retried, observed, and
//! dead-lettered on its own, and the reconciliation layer can report
//! per-stage progress.

use crate::broker::{Broker, JobContext, JobOptions, Processor};
use crate::config::PipelineConfig;
use crate::pipeline::orchestrator::SubmissionRegistry;
use crate::pipeline::stages::Stage;
use async_trait::async_trait;
use serde_json::json;

/// Priority for the analytics job; runs ahead of other waiting work.
const ANALYTICS_PRIORITY: i32 = 10;

/// Processor bound to the pipeline queue.
pub struct ContinuationProcessor {
    broker: Broker,
    registry: SubmissionRegistry,
    config: PipelineConfig,
}

impl ContinuationProcessor {
    /// Create the continuation processor.
    pub fn new(broker: Broker, registry: SubmissionRegistry, config: PipelineConfig) -> Self {
        Self {
            broker,
            registry,
            config,
        }
    }
}

#[async_trait]
impl Processor for ContinuationProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = ctx
            .data()
            .get("orderId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("pipeline job payload has no orderId"))?
            .to_string();

        ctx.log(&format!(
            "Order pipeline complete for {}, triggering fulfillment chain",
            order_id
        ));

        // Children values: payment transaction and inventory reservation.
        let children_values = ctx.children_values();
        let payment_ok = children_values
            .values()
            .any(|v| v.get("transactionId").is_some());
        let inventory_ok = children_values
            .values()
            .any(|v| v.get("reserved").is_some() || v.get("deduplicated").is_some());
        if !payment_ok || !inventory_ok {
            anyhow::bail!(
                "malformed children values for {}: payment={}, inventory={}",
                order_id,
                payment_ok,
                inventory_ok
            );
        }
        ctx.log(&format!(
            "Children results: {}",
            serde_json::to_string(&children_values)?
        ));

        let shipping_queue = self
            .broker
            .queue(Stage::Shipping.queue_name())
            .ok_or_else(|| anyhow::anyhow!("shipping queue missing"))?;
        let notification_queue = self
            .broker
            .queue(Stage::Notification.queue_name())
            .ok_or_else(|| anyhow::anyhow!("notification queue missing"))?;
        let analytics_queue = self
            .broker
            .queue(Stage::Analytics.queue_name())
            .ok_or_else(|| anyhow::anyhow!("analytics queue missing"))?;

        let shipping = shipping_queue.add(
            "ship-order",
            json!({
                "orderId": order_id,
                "childrenValues": children_values,
            }),
            JobOptions::default(),
        );
        self.registry.record(&shipping.id, &order_id);

        // Delayed so shipping finishes before the customer is notified.
        let notification = notification_queue.add(
            "notify-customer",
            json!({
                "orderId": order_id,
                "channel": "email",
            }),
            JobOptions {
                delay_ms: Some(self.config.notification_delay_ms),
                ..Default::default()
            },
        );
        self.registry.record(&notification.id, &order_id);

        // Analytics result need not be retained once recorded.
        let analytics = analytics_queue.add(
            "log-order",
            json!({
                "orderId": order_id,
                "eventType": "order_complete",
            }),
            JobOptions {
                priority: ANALYTICS_PRIORITY,
                remove_on_complete: true,
                ..Default::default()
            },
        );
        self.registry.record(&analytics.id, &order_id);

        Ok(json!({
            "orderId": order_id,
            "status": "fulfillment_triggered",
        }))
    }
}
