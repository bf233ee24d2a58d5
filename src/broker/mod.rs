//! In-process job-queue broker
//!
//! The substrate the pipeline runs on: named queues, concurrency-bounded
//! workers, atomic parent+children flows, per-queue lifecycle events, bounded
//! retry with backoff, deduplication, delayed jobs, priorities, best-effort
//! revocation and dead-letter routing.
//!
//! Everything is process-local and in-memory; durable job state is a
//! non-goal. The pipeline modules consume the broker only through the public
//! surface here, so its internals stay out of the orchestration design.

pub mod events;
pub mod flow;
pub mod job;
pub mod queue;
pub mod worker;

pub use events::{EventKind, JobEvent};
pub use flow::{ChildSpec, FlowError, FlowHandle, FlowProducer, FlowSpec};
pub use job::{Backoff, Deduplication, Job, JobCounts, JobId, JobOptions, JobState, ParentRef};
pub use queue::{Queue, RevokeOutcome};
pub use worker::{JobContext, Processor, Worker, WorkerOptions};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::warn;

/// Registry of every queue the process operates.
///
/// Built once at startup; handles are cheap to clone.
#[derive(Clone)]
pub struct Broker {
    queues: Arc<HashMap<String, Queue>>,
}

impl Broker {
    /// Build a broker over a fixed set of queues.
    pub fn new(queues: Vec<Queue>) -> Self {
        let map = queues
            .into_iter()
            .map(|q| (q.name().to_string(), q))
            .collect();
        Self {
            queues: Arc::new(map),
        }
    }

    /// Look up a queue by name.
    pub fn queue(&self, name: &str) -> Option<Queue> {
        self.queues.get(name).cloned()
    }

    /// All queue handles, unordered.
    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    /// Best-effort revocation of a job, with fan-in bookkeeping: revoking a
    /// flow child fails its parent the same way a terminal failure would.
    pub fn revoke(&self, queue_name: &str, job_id: &JobId) -> RevokeOutcome {
        let Some(queue) = self.queue(queue_name) else {
            return RevokeOutcome::NotFound;
        };
        let (outcome, parent) = queue.revoke(job_id);
        if let Some(parent) = parent {
            self.child_failed(&parent, job_id, "revoked");
        }
        outcome
    }

    /// Spawn a repeating job submission (e.g. a scheduled report) on the
    /// named queue. The returned handle stops the schedule when aborted.
    pub fn spawn_repeating(
        &self,
        queue_name: &str,
        job_name: &str,
        data: serde_json::Value,
        every: Duration,
    ) -> Option<JoinHandle<()>> {
        let queue = self.queue(queue_name)?;
        let job_name = job_name.to_string();
        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick fires immediately; skip it so the schedule starts
            // one period after startup.
            interval.tick().await;
            loop {
                interval.tick().await;
                queue.add(
                    &job_name,
                    data.clone(),
                    JobOptions {
                        remove_on_complete: true,
                        ..Default::default()
                    },
                );
            }
        }))
    }

    pub(crate) fn child_completed(
        &self,
        parent: &ParentRef,
        child_id: &JobId,
        value: serde_json::Value,
    ) {
        match self.queue(&parent.queue) {
            Some(queue) => {
                queue.child_completed(&parent.id, child_id, value);
            }
            None => warn!(
                parent_queue = %parent.queue,
                child_id = %child_id,
                "Child finished but parent queue is gone"
            ),
        }
    }

    pub(crate) fn child_failed(&self, parent: &ParentRef, child_id: &JobId, reason: &str) {
        match self.queue(&parent.queue) {
            Some(queue) => queue.child_failed(&parent.id, child_id, reason),
            None => warn!(
                parent_queue = %parent.queue,
                child_id = %child_id,
                "Child failed but parent queue is gone"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_queue_lookup() {
        let broker = Broker::new(vec![Queue::new("a"), Queue::new("b")]);
        assert!(broker.queue("a").is_some());
        assert!(broker.queue("missing").is_none());
        assert_eq!(broker.queues().count(), 2);
    }

    #[tokio::test]
    async fn test_revoke_unknown_queue() {
        let broker = Broker::new(vec![]);
        assert_eq!(
            broker.revoke("ghost", &"job".to_string()),
            RevokeOutcome::NotFound
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_schedule_submits_jobs() {
        let broker = Broker::new(vec![Queue::new("analytics")]);
        let handle = broker
            .spawn_repeating(
                "analytics",
                "daily-report",
                json!({"eventType": "scheduled_report"}),
                Duration::from_secs(30),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        let queue = broker.queue("analytics").unwrap();
        assert!(queue.counts().waiting >= 1);
        handle.abort();
    }
}
