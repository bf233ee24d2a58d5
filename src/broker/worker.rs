//! Worker loops
//!
//! A [`Worker`] drives one queue: it claims runnable jobs, executes them
//! through a [`Processor`] with bounded concurrency, and routes outcomes back
//! into the queue (completion, retry with backoff, dead-lettering) and to any
//! flow parent the job gates.

use crate::broker::job::{Job, JobId};
use crate::broker::queue::{FailDisposition, NextReady, Queue};
use crate::broker::Broker;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// A stage handler bound to one queue.
///
/// Processors receive a [`JobContext`] and return the job's value or an error;
/// the worker loop owns all retry and terminal-state routing.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Execute one job attempt.
    async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Execution context handed to a processor for one attempt.
pub struct JobContext {
    job: Job,
    queue: Queue,
}

impl JobContext {
    /// Build a context for a job on its queue. Workers do this at claim
    /// time; tests may construct one directly to drive a processor.
    pub fn new(job: Job, queue: Queue) -> Self {
        Self { job, queue }
    }

    /// The job being executed (snapshot taken at claim time).
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The job's JSON payload.
    pub fn data(&self) -> &serde_json::Value {
        &self.job.data
    }

    /// Append a log line to the job record.
    pub fn log(&self, line: &str) {
        debug!(queue = %self.queue.name(), job_id = %self.job.id, "{}", line);
        self.queue.append_log(&self.job.id, line);
    }

    /// Report execution progress (0-100) as a lifecycle event.
    pub fn update_progress(&self, progress: u8) {
        self.queue.report_progress(&self.job.id, progress);
    }

    /// Values returned by this job's completed children, keyed by child job
    /// id. Empty unless the job is a flow parent.
    pub fn children_values(&self) -> HashMap<JobId, serde_json::Value> {
        self.queue.children_values(&self.job.id)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Maximum jobs of this queue executing in parallel
    pub concurrency: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

/// Handle to a running worker loop.
pub struct Worker {
    queue_name: String,
    dispatch: JoinHandle<()>,
}

impl Worker {
    /// Start a worker for `queue`, executing jobs with `processor`.
    pub fn start(
        queue: Queue,
        broker: Broker,
        processor: Arc<dyn Processor>,
        opts: WorkerOptions,
    ) -> Self {
        let queue_name = queue.name().to_string();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));

        let dispatch = tokio::spawn({
            let queue = queue.clone();
            async move {
                loop {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    match queue.next_ready() {
                        NextReady::Job(job) => {
                            let queue = queue.clone();
                            let broker = broker.clone();
                            let processor = Arc::clone(&processor);
                            tokio::spawn(async move {
                                run_attempt(queue, broker, processor, job).await;
                                drop(permit);
                            });
                        }
                        NextReady::Idle(deadline) => {
                            drop(permit);
                            queue.idle(deadline).await;
                        }
                    }
                }
            }
        });

        info!(queue = %queue_name, concurrency = opts.concurrency, "Worker started");
        Self { queue_name, dispatch }
    }

    /// Queue this worker serves.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Stop the dispatch loop. In-flight attempts finish on their own tasks.
    pub fn shutdown(&self) {
        self.dispatch.abort();
    }
}

async fn run_attempt(queue: Queue, broker: Broker, processor: Arc<dyn Processor>, job: Job) {
    let job_id = job.id.clone();
    let timeout_ms = job.opts.timeout_ms;
    let ctx = JobContext {
        job,
        queue: queue.clone(),
    };

    let outcome = match timeout_ms {
        Some(ms) => {
            match tokio::time::timeout(Duration::from_millis(ms), processor.process(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("execution timed out after {}ms", ms)),
            }
        }
        None => processor.process(&ctx).await,
    };

    match outcome {
        Ok(value) => {
            debug!(queue = %queue.name(), job_id = %job_id, "Job completed");
            if let Some(parent) = queue.complete(&job_id, value.clone()) {
                broker.child_completed(&parent, &job_id, value);
            }
        }
        Err(e) => {
            let reason = e.to_string();
            error!(queue = %queue.name(), job_id = %job_id, reason = %reason, "Job attempt failed");
            let (disposition, parent) = queue.fail_attempt(&job_id, &reason);
            if disposition != FailDisposition::Retried {
                if let Some(parent) = parent {
                    broker.child_failed(&parent, &job_id, &reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::job::{Backoff, JobOptions, JobState};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn process(&self, ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            Ok(ctx.data().clone())
        }
    }

    struct FailTimes {
        budget: AtomicU32,
    }

    #[async_trait]
    impl Processor for FailTimes {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            if self.budget.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
                anyhow::bail!("simulated failure");
            }
            Ok(json!({"ok": true}))
        }
    }

    async fn wait_for_state(queue: &Queue, job_id: &JobId, state: JobState) {
        for _ in 0..200 {
            if queue.get_job(job_id).map(|j| j.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {:?}", job_id, state);
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let broker = Broker::new(vec![Queue::new("echo")]);
        let queue = broker.queue("echo").unwrap();
        let worker = Worker::start(
            queue.clone(),
            broker.clone(),
            Arc::new(Echo),
            WorkerOptions { concurrency: 2 },
        );

        let job = queue.add("e", json!({"x": 42}), JobOptions::default());
        wait_for_state(&queue, &job.id, JobState::Completed).await;
        assert_eq!(
            queue.get_job(&job.id).unwrap().return_value,
            Some(json!({"x": 42}))
        );
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_worker_retries_then_completes() {
        let broker = Broker::new(vec![Queue::new("flaky")]);
        let queue = broker.queue("flaky").unwrap();
        let worker = Worker::start(
            queue.clone(),
            broker.clone(),
            Arc::new(FailTimes {
                budget: AtomicU32::new(2),
            }),
            WorkerOptions::default(),
        );

        let job = queue.add(
            "f",
            json!({}),
            JobOptions {
                attempts: 3,
                backoff: Some(Backoff::Fixed { delay_ms: 5 }),
                ..Default::default()
            },
        );
        wait_for_state(&queue, &job.id, JobState::Completed).await;
        assert_eq!(queue.get_job(&job.id).unwrap().attempts_made, 3);
        worker.shutdown();
    }

    #[tokio::test]
    async fn test_worker_exhausts_retries_to_dead_letter() {
        let dlq = Queue::new("dead-letter");
        let queue = Queue::new("payment").with_dead_letter(dlq.clone());
        let broker = Broker::new(vec![queue.clone(), dlq.clone()]);
        let worker = Worker::start(
            queue.clone(),
            broker.clone(),
            Arc::new(FailTimes {
                budget: AtomicU32::new(10),
            }),
            WorkerOptions::default(),
        );

        let job = queue.add(
            "charge",
            json!({"orderId": "ord_1"}),
            JobOptions {
                attempts: 3,
                backoff: Some(Backoff::Fixed { delay_ms: 1 }),
                ..Default::default()
            },
        );
        wait_for_state(&queue, &job.id, JobState::Failed).await;

        // Dead-letter entry carries origin and attempt count
        for _ in 0..100 {
            if !dlq.get_jobs(JobState::Waiting, 10).is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let entries = dlq.get_jobs(JobState::Waiting, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts_made, 3);
        assert_eq!(entries[0].origin_queue.as_deref(), Some("payment"));
        worker.shutdown();
    }

    struct Slow;

    #[async_trait]
    impl Processor for Slow {
        async fn process(&self, _ctx: &JobContext) -> anyhow::Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!(null))
        }
    }

    #[tokio::test]
    async fn test_worker_enforces_timeout() {
        let broker = Broker::new(vec![Queue::new("slow")]);
        let queue = broker.queue("slow").unwrap();
        let worker = Worker::start(queue.clone(), broker.clone(), Arc::new(Slow), WorkerOptions::default());

        let job = queue.add(
            "s",
            json!({}),
            JobOptions {
                timeout_ms: Some(20),
                ..Default::default()
            },
        );
        wait_for_state(&queue, &job.id, JobState::Failed).await;
        let reason = queue.get_job(&job.id).unwrap().failed_reason.unwrap();
        assert!(reason.contains("timed out"));
        worker.shutdown();
    }
}
