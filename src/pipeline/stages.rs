//! Stage registry for the order pipeline
//!
//! Static description of the pipeline stages: their order, human labels, and
//! the queue each stage's jobs are submitted to. Pure data, no behavior.

use serde::{Deserialize, Serialize};

/// Queue name for the parent pipeline job (fan-in over the children).
pub const PIPELINE_QUEUE: &str = "order-pipeline";

/// Queue name for the dead-letter sink.
pub const DEAD_LETTER_QUEUE: &str = "dead-letter";

/// One named step of the order pipeline.
///
/// The first two stages (`Payment`, `Inventory`) run as concurrent children of
/// the parent pipeline job; the remaining three run as a sequential chain
/// submitted by the continuation worker after the children complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Charge the customer's payment method
    Payment,
    /// Reserve stock for the order's line items
    Inventory,
    /// Generate a shipping label
    Shipping,
    /// Notify the customer
    Notification,
    /// Record the completed order for reporting
    Analytics,
}

impl Stage {
    /// All stages in pipeline order.
    pub const ALL: [Stage; 5] = [
        Stage::Payment,
        Stage::Inventory,
        Stage::Shipping,
        Stage::Notification,
        Stage::Analytics,
    ];

    /// Stable key for this stage (also its queue name).
    pub fn key(&self) -> &'static str {
        match self {
            Stage::Payment => "payment",
            Stage::Inventory => "inventory",
            Stage::Shipping => "shipping",
            Stage::Notification => "notification",
            Stage::Analytics => "analytics",
        }
    }

    /// Queue this stage's jobs are submitted to.
    pub fn queue_name(&self) -> &'static str {
        self.key()
    }

    /// Resolve a queue name to a pipeline stage.
    ///
    /// This is an exhaustive mapping: the pipeline queue and the dead-letter
    /// queue deliberately resolve to `None` because their events do not belong
    /// to any single stage.
    pub fn for_queue(queue: &str) -> Option<Stage> {
        match queue {
            "payment" => Some(Stage::Payment),
            "inventory" => Some(Stage::Inventory),
            "shipping" => Some(Stage::Shipping),
            "notification" => Some(Stage::Notification),
            "analytics" => Some(Stage::Analytics),
            _ => None,
        }
    }
}

/// Every queue name the server operates, in dashboard display order.
///
/// The five stage queues plus the parent pipeline queue and the dead-letter
/// sink. The event relay opens one subscription per entry.
pub fn all_queue_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = Stage::ALL.iter().map(|s| s.queue_name()).collect();
    names.push(PIPELINE_QUEUE);
    names.push(DEAD_LETTER_QUEUE);
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        assert_eq!(Stage::ALL[0], Stage::Payment);
        assert_eq!(Stage::ALL[1], Stage::Inventory);
        assert_eq!(Stage::ALL[4], Stage::Analytics);
    }

    #[test]
    fn test_for_queue_exhaustive() {
        for stage in Stage::ALL {
            assert_eq!(Stage::for_queue(stage.queue_name()), Some(stage));
        }
        // Non-stage queues never resolve to a stage
        assert_eq!(Stage::for_queue(PIPELINE_QUEUE), None);
        assert_eq!(Stage::for_queue(DEAD_LETTER_QUEUE), None);
        assert_eq!(Stage::for_queue("payment-v2"), None);
        assert_eq!(Stage::for_queue(""), None);
    }

    #[test]
    fn test_all_queue_names() {
        let names = all_queue_names();
        assert_eq!(names.len(), 7);
        assert!(names.contains(&"payment"));
        assert!(names.contains(&PIPELINE_QUEUE));
        assert!(names.contains(&DEAD_LETTER_QUEUE));
    }

    #[test]
    fn test_stage_serializes_lowercase() {
        let json = serde_json::to_string(&Stage::Payment).unwrap();
        assert_eq!(json, "\"payment\"");
    }
}
