//! Toy stage processors
//!
//! The business logic of each stage is deliberately trivial; what matters is
//! the lifecycle each job goes through (progress, retries, dead-lettering)
//! and the events it emits. Payment declines can be forced through the order
//! payload's `simulate` block or left to the configured random rate.

use crate::broker::{JobContext, Processor};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Charges the customer's payment method. Subject to bounded retry with
/// backoff; exhaustion routes the job to the dead-letter queue.
pub struct PaymentProcessor {
    /// Simulated decline rate, percent 0-100, applied when the payload does
    /// not force an outcome
    pub decline_rate: u8,
}

#[async_trait]
impl Processor for PaymentProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = order_id(ctx);
        ctx.log(&format!("Payment processing started for order {}", order_id));
        ctx.update_progress(25);
        ctx.log("Validating payment details...");
        tokio::time::sleep(Duration::from_millis(300)).await;

        ctx.update_progress(50);
        ctx.log("Charging payment method...");
        tokio::time::sleep(Duration::from_millis(400)).await;

        let declined = match simulate(ctx, "payment") {
            Some("decline") => true,
            Some("approve") => false,
            _ => chance(self.decline_rate),
        };
        if declined {
            anyhow::bail!("Payment declined by provider");
        }

        ctx.update_progress(75);
        ctx.log("Confirming transaction...");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let transaction_id = format!(
            "txn_{}_{}",
            chrono::Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );
        ctx.log(&format!("Payment confirmed: {}", transaction_id));
        Ok(json!({ "transactionId": transaction_id }))
    }
}

/// Reserves stock for the order's first line item.
pub struct InventoryProcessor;

#[async_trait]
impl Processor for InventoryProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = order_id(ctx);
        let sku = ctx
            .data()
            .pointer("/items/0/sku")
            .and_then(|v| v.as_str())
            .unwrap_or("SKU-UNKNOWN")
            .to_string();

        ctx.log(&format!(
            "Checking inventory for order {}, SKU: {}",
            order_id, sku
        ));
        tokio::time::sleep(Duration::from_millis(200)).await;

        ctx.log(&format!("Inventory reserved for {}", sku));
        Ok(json!({ "reserved": true, "sku": sku }))
    }
}

/// Generates a shipping label and tracking number.
pub struct ShippingProcessor;

#[async_trait]
impl Processor for ShippingProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = order_id(ctx);
        ctx.log(&format!("Generating shipping label for order {}", order_id));
        tokio::time::sleep(Duration::from_millis(500)).await;

        let tracking_number = format!(
            "SHIP-{}-{}",
            chrono::Utc::now().timestamp_millis(),
            &uuid::Uuid::new_v4().simple().to_string()[..4].to_uppercase()
        );
        ctx.log(&format!("Tracking number: {}", tracking_number));
        Ok(json!({ "trackingNumber": tracking_number }))
    }
}

/// Sends the customer notification over the payload's channel.
pub struct NotificationProcessor;

#[async_trait]
impl Processor for NotificationProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = order_id(ctx);
        let channel = ctx
            .data()
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or("email")
            .to_string();

        ctx.log(&format!(
            "Sending {} notification for order {}",
            channel, order_id
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;

        ctx.log(&format!("Notification sent via {}", channel));
        Ok(json!({ "sent": true, "channel": channel }))
    }
}

/// Records an order event for reporting. Also serves the scheduled report
/// jobs the broker submits periodically.
pub struct AnalyticsProcessor;

#[async_trait]
impl Processor for AnalyticsProcessor {
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
        let order_id = order_id(ctx);
        let event_type = ctx
            .data()
            .get("eventType")
            .and_then(|v| v.as_str())
            .unwrap_or("order_complete");
        ctx.log(&format!("Analytics: {} for order {}", event_type, order_id));
        Ok(json!({ "logged": true }))
    }
}

fn order_id(ctx: &JobContext) -> String {
    ctx.data()
        .get("orderId")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string()
}

/// Forced stage outcome from the payload's `simulate` block, if present.
fn simulate<'a>(ctx: &'a JobContext, stage: &str) -> Option<&'a str> {
    ctx.data()
        .pointer(&format!("/simulate/{}", stage))
        .and_then(|v| v.as_str())
}

/// True with roughly `percent` probability. Backed by the OS RNG via uuid v4.
fn chance(percent: u8) -> bool {
    if percent == 0 {
        return false;
    }
    (uuid::Uuid::new_v4().as_u128() % 100) < u128::from(percent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobOptions, Queue};

    fn ctx(queue: &str, data: serde_json::Value) -> JobContext {
        let q = Queue::new(queue);
        let job = q.add("test", data, JobOptions::default());
        JobContext::new(job, q)
    }

    #[tokio::test]
    async fn test_payment_approves_when_forced() {
        let processor = PaymentProcessor { decline_rate: 100 };
        let ctx = ctx(
            "payment",
            json!({"orderId": "ord_1", "simulate": {"payment": "approve"}}),
        );
        let value = processor.process(&ctx).await.unwrap();
        assert!(value["transactionId"].as_str().unwrap().starts_with("txn_"));
    }

    #[tokio::test]
    async fn test_payment_declines_when_forced() {
        let processor = PaymentProcessor { decline_rate: 0 };
        let ctx = ctx(
            "payment",
            json!({"orderId": "ord_1", "simulate": {"payment": "decline"}}),
        );
        let err = processor.process(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("declined"));
    }

    #[tokio::test]
    async fn test_payment_zero_rate_never_declines() {
        let processor = PaymentProcessor { decline_rate: 0 };
        let ctx = ctx("payment", json!({"orderId": "ord_1"}));
        assert!(processor.process(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_inventory_reserves_first_sku() {
        let ctx = ctx(
            "inventory",
            json!({"orderId": "ord_1", "items": [{"sku": "WIDGET-001", "qty": 1}]}),
        );
        let value = InventoryProcessor.process(&ctx).await.unwrap();
        assert_eq!(value["reserved"], true);
        assert_eq!(value["sku"], "WIDGET-001");
    }

    #[tokio::test]
    async fn test_inventory_unknown_sku_fallback() {
        let ctx = ctx("inventory", json!({"orderId": "ord_1"}));
        let value = InventoryProcessor.process(&ctx).await.unwrap();
        assert_eq!(value["sku"], "SKU-UNKNOWN");
    }

    #[tokio::test]
    async fn test_shipping_returns_tracking_number() {
        let ctx = ctx("shipping", json!({"orderId": "ord_1"}));
        let value = ShippingProcessor.process(&ctx).await.unwrap();
        assert!(value["trackingNumber"]
            .as_str()
            .unwrap()
            .starts_with("SHIP-"));
    }

    #[tokio::test]
    async fn test_notification_defaults_to_email() {
        let ctx = ctx("notification", json!({"orderId": "ord_1"}));
        let value = NotificationProcessor.process(&ctx).await.unwrap();
        assert_eq!(value["channel"], "email");
        assert_eq!(value["sent"], true);
    }

    #[tokio::test]
    async fn test_analytics_logs_event() {
        let ctx = ctx(
            "analytics",
            json!({"orderId": "system", "eventType": "scheduled_report"}),
        );
        let value = AnalyticsProcessor.process(&ctx).await.unwrap();
        assert_eq!(value["logged"], true);
    }
}
