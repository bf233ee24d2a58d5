//! Dead-letter router
//!
//! The terminal sink for payment jobs that exhaust their retry budget.
//! Entries are exposed for operator inspection only; replay is an explicit
//! resubmission through the flow orchestrator, never automatic.

use crate::broker::{JobState, Queue};
use serde::Serialize;

/// One inspectable dead-letter entry.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterEntry {
    /// Dead-letter job identifier
    #[serde(rename = "jobId")]
    pub job_id: String,
    /// Queue the job originally failed on
    #[serde(rename = "queueOfOrigin")]
    pub queue_of_origin: String,
    /// Original job payload
    pub payload: serde_json::Value,
    /// Why the final attempt failed
    #[serde(rename = "failureReason")]
    pub failure_reason: Option<String>,
    /// When the entry was created, milliseconds since the epoch
    pub timestamp: i64,
    /// Attempts made before dead-lettering
    #[serde(rename = "attemptsMade")]
    pub attempts_made: u32,
}

/// Read-only view over the dead-letter queue.
#[derive(Clone)]
pub struct DeadLetterRouter {
    queue: Queue,
}

impl DeadLetterRouter {
    /// Wrap the dead-letter queue.
    pub fn new(queue: Queue) -> Self {
        Self { queue }
    }

    /// Most recent dead-letter entries, newest first, capped at `limit`.
    pub fn list_entries(&self, limit: usize) -> Vec<DeadLetterEntry> {
        self.queue
            .get_jobs(JobState::Waiting, limit)
            .into_iter()
            .map(|job| DeadLetterEntry {
                job_id: job.id,
                queue_of_origin: job
                    .origin_queue
                    .unwrap_or_else(|| "unknown".to_string()),
                payload: job.data,
                failure_reason: job.failed_reason,
                timestamp: job.timestamp,
                attempts_made: job.attempts_made,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{JobOptions, Queue};
    use crate::pipeline::stages::DEAD_LETTER_QUEUE;
    use serde_json::json;

    #[tokio::test]
    async fn test_list_entries_empty() {
        let router = DeadLetterRouter::new(Queue::new(DEAD_LETTER_QUEUE));
        assert!(router.list_entries(50).is_empty());
    }

    #[tokio::test]
    async fn test_list_entries_after_exhaustion() {
        let dlq = Queue::new(DEAD_LETTER_QUEUE);
        let payment = Queue::new("payment").with_dead_letter(dlq.clone());
        let router = DeadLetterRouter::new(dlq);

        payment.add("charge", json!({"orderId": "ord_1"}), JobOptions::default());
        if let crate::broker::queue::NextReady::Job(job) = payment.next_ready() {
            payment.fail_attempt(&job.id, "declined");
        }

        let entries = router.list_entries(50);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].queue_of_origin, "payment");
        assert_eq!(entries[0].failure_reason.as_deref(), Some("declined"));
        assert_eq!(entries[0].payload["orderId"], "ord_1");
        assert_eq!(entries[0].attempts_made, 1);
    }
}
