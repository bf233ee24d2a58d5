//! Job data model for the in-process broker
//!
//! A `Job` is one submitted unit of work owned by a named queue. Terminal
//! states are produced by the worker loop and observed through lifecycle
//! events, never set directly by callers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a job, assigned by the broker at submission time.
pub type JobId = String;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Ready to be picked up by a worker
    Waiting,
    /// Scheduled to become waiting after a delay (initial delay or backoff)
    Delayed,
    /// Gated on child jobs reaching a terminal state
    WaitingChildren,
    /// Currently executing in a worker
    Active,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully (retries exhausted or non-retryable)
    Failed,
    /// Revoked before execution started
    Revoked,
}

impl JobState {
    /// Whether this state is terminal (the job will never run again).
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Revoked)
    }
}

/// Retry backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Backoff {
    /// Delay doubles with each failed attempt, starting from `delay_ms`.
    Exponential {
        /// Base delay in milliseconds for the first retry
        delay_ms: u64,
    },
    /// Constant delay between attempts.
    Fixed {
        /// Delay in milliseconds between attempts
        delay_ms: u64,
    },
}

impl Backoff {
    /// Delay to apply before the next attempt, given how many attempts have
    /// already been made (>= 1 when a retry is being scheduled).
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self {
            Backoff::Exponential { delay_ms } => {
                let exp = attempts_made.saturating_sub(1).min(16);
                Duration::from_millis(delay_ms.saturating_mul(1u64 << exp))
            }
            Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        }
    }
}

/// Request deduplication configuration.
///
/// While a job holding the key is not yet terminal, another `add` with the
/// same key coalesces to the existing job instead of scheduling a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deduplication {
    /// Key the submission is deduplicated on
    pub id: String,
}

/// Per-job submission options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum number of execution attempts (including the first)
    pub attempts: u32,
    /// Backoff policy applied between attempts
    pub backoff: Option<Backoff>,
    /// Hard execution timeout per attempt, in milliseconds
    pub timeout_ms: Option<u64>,
    /// Initial delay before the job becomes runnable, in milliseconds
    pub delay_ms: Option<u64>,
    /// Scheduling priority; higher runs first among waiting jobs
    pub priority: i32,
    /// Discard the job record after successful completion
    pub remove_on_complete: bool,
    /// Deduplicate submissions sharing a key
    pub deduplication: Option<Deduplication>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: None,
            timeout_ms: None,
            delay_ms: None,
            priority: 0,
            remove_on_complete: false,
            deduplication: None,
        }
    }
}

/// Reference from a child job to the parent it gates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    /// Queue holding the parent job
    pub queue: String,
    /// Parent job identifier
    pub id: JobId,
}

/// One submitted unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Broker-assigned identifier
    pub id: JobId,
    /// Caller-supplied job name (e.g. "charge-payment")
    pub name: String,
    /// Queue this job belongs to
    pub queue: String,
    /// Arbitrary JSON payload carried to the processor
    pub data: serde_json::Value,
    /// Submission options
    pub opts: JobOptions,
    /// Current lifecycle state
    pub state: JobState,
    /// Number of execution attempts made so far
    pub attempts_made: u32,
    /// Return value, once completed
    pub return_value: Option<serde_json::Value>,
    /// Failure reason, once failed
    pub failed_reason: Option<String>,
    /// Creation timestamp, milliseconds since the epoch
    pub timestamp: i64,
    /// Completion/failure timestamp, milliseconds since the epoch
    pub finished_on: Option<i64>,
    /// Parent this job gates, if it was submitted as a flow child
    pub parent: Option<ParentRef>,
    /// Queue the job originally failed on, for dead-letter entries
    pub origin_queue: Option<String>,
    /// Processor log lines, oldest first
    pub logs: Vec<String>,
}

impl Job {
    /// Create a new job record in its initial state.
    ///
    /// The initial state is `Delayed` when an initial delay is configured,
    /// otherwise `Waiting`. Flow parents are switched to `WaitingChildren` by
    /// the flow producer after creation.
    pub fn new(name: &str, queue: &str, data: serde_json::Value, opts: JobOptions) -> Self {
        let state = if opts.delay_ms.unwrap_or(0) > 0 {
            JobState::Delayed
        } else {
            JobState::Waiting
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            queue: queue.to_string(),
            data,
            opts,
            state,
            attempts_made: 0,
            return_value: None,
            failed_reason: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
            finished_on: None,
            parent: None,
            origin_queue: None,
            logs: Vec::new(),
        }
    }
}

/// Per-queue job counts for the dashboard.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    /// Jobs waiting, delayed, or gated on children
    pub waiting: usize,
    /// Jobs currently executing
    pub active: usize,
    /// Jobs finished successfully
    pub completed: usize,
    /// Jobs finished unsuccessfully
    pub failed: usize,
}
