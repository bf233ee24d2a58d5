//! Named job queues
//!
//! A [`Queue`] owns its job records, its dedup table, and its lifecycle event
//! channel. Handles are cheap to clone and internally synchronized; worker
//! loops drive execution through [`Queue::next_ready`] and the completion
//! methods.

use crate::broker::events::{EventKind, EventSender, JobEvent};
use crate::broker::job::{Job, JobCounts, JobId, JobOptions, JobState, ParentRef};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Outcome of a revoke request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeOutcome {
    /// The job was still waiting and has been revoked
    Revoked,
    /// The job is already executing or terminal; revocation is a no-op
    TooLate,
    /// No job with that id exists on this queue
    NotFound,
}

impl RevokeOutcome {
    /// Stable string form for API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            RevokeOutcome::Revoked => "revoked",
            RevokeOutcome::TooLate => "too_late",
            RevokeOutcome::NotFound => "not_found",
        }
    }
}

/// What a worker should do next, as reported by [`Queue::next_ready`].
#[derive(Debug)]
pub enum NextReady {
    /// A job was claimed; execute it
    Job(Job),
    /// Nothing runnable; sleep until the given deadline (next delayed job) or
    /// until the queue signals new work
    Idle(Option<Instant>),
}

/// Disposition of a failed attempt, decided by the queue from the job's
/// retry budget and dead-letter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailDisposition {
    /// The job was rescheduled with backoff
    Retried,
    /// Retries exhausted; the job was moved to the dead-letter queue
    DeadLettered,
    /// Retries exhausted; the job failed in place
    Failed,
}

/// Fan-in gate for a flow parent: how many children are still pending and the
/// values of those already completed.
#[derive(Debug, Default)]
struct ChildrenGate {
    remaining: usize,
    values: HashMap<JobId, serde_json::Value>,
}

#[derive(Default)]
struct JobStore {
    jobs: HashMap<JobId, Job>,
    /// Delayed job id -> instant it becomes runnable
    delayed_until: HashMap<JobId, Instant>,
    /// Dedup key -> live job holding it
    dedup: HashMap<String, JobId>,
    /// Parent job id -> children gate (parents living on this queue)
    gates: HashMap<JobId, ChildrenGate>,
}

struct QueueInner {
    name: String,
    store: Mutex<JobStore>,
    events: EventSender,
    dead_letter: Mutex<Option<Queue>>,
    wake: Notify,
}

/// Cloneable handle to a named queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl Queue {
    /// Create a new empty queue.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.to_string(),
                store: Mutex::new(JobStore::default()),
                events: EventSender::new(),
                dead_letter: Mutex::new(None),
                wake: Notify::new(),
            }),
        }
    }

    /// Configure the terminal sink for jobs that exhaust their retry budget.
    pub fn with_dead_letter(self, dlq: Queue) -> Self {
        *self.inner.dead_letter.lock().expect("dead_letter lock") = Some(dlq);
        self
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscribe to this queue's lifecycle events.
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Submit a job.
    ///
    /// When the options carry a dedup key already held by a live job, the
    /// existing job is returned unchanged and nothing new is scheduled.
    pub fn add(&self, name: &str, data: serde_json::Value, opts: JobOptions) -> Job {
        let job = Job::new(name, &self.inner.name, data, opts);
        self.insert(job)
    }

    /// Insert a pre-built job record (used by the flow producer so parent
    /// references survive submission).
    pub(crate) fn insert(&self, job: Job) -> Job {
        let snapshot = {
            let mut store = self.inner.store.lock().expect("queue store lock");

            if let Some(dedup) = &job.opts.deduplication {
                if let Some(existing_id) = store.dedup.get(&dedup.id) {
                    if let Some(existing) = store.jobs.get(existing_id) {
                        if !existing.state.is_terminal() {
                            tracing::debug!(
                                queue = %self.inner.name,
                                dedup_id = %dedup.id,
                                job_id = %existing.id,
                                "Duplicate submission coalesced to existing job"
                            );
                            return existing.clone();
                        }
                    }
                }
                store.dedup.insert(dedup.id.clone(), job.id.clone());
            }

            if job.state == JobState::Delayed {
                let delay = std::time::Duration::from_millis(job.opts.delay_ms.unwrap_or(0));
                store.delayed_until.insert(job.id.clone(), Instant::now() + delay);
            }
            store.jobs.insert(job.id.clone(), job.clone());
            job
        };

        self.inner.events.emit(JobEvent::new(EventKind::Enqueued, &snapshot.id));
        self.inner.wake.notify_one();
        snapshot
    }

    /// Register a fan-in gate for a parent job living on this queue.
    pub(crate) fn register_gate(&self, parent_id: &JobId, child_count: usize) {
        let mut store = self.inner.store.lock().expect("queue store lock");
        store.gates.insert(
            parent_id.clone(),
            ChildrenGate {
                remaining: child_count,
                values: HashMap::new(),
            },
        );
        if let Some(parent) = store.jobs.get_mut(parent_id) {
            parent.state = JobState::WaitingChildren;
        }
    }

    /// Record a successful child and, if it was the last one, release the
    /// parent onto the queue. Returns true when the parent became runnable.
    pub(crate) fn child_completed(
        &self,
        parent_id: &JobId,
        child_id: &JobId,
        value: serde_json::Value,
    ) -> bool {
        let released = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            let Some(gate) = store.gates.get_mut(parent_id) else {
                return false;
            };
            gate.values.insert(child_id.clone(), value);
            gate.remaining = gate.remaining.saturating_sub(1);
            if gate.remaining > 0 {
                return false;
            }
            if let Some(parent) = store.jobs.get_mut(parent_id) {
                if parent.state == JobState::WaitingChildren {
                    parent.state = JobState::Waiting;
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if released {
            self.inner.wake.notify_one();
        }
        released
    }

    /// Fail a parent because one of its children reached a terminal
    /// non-success state.
    pub(crate) fn child_failed(&self, parent_id: &JobId, child_id: &JobId, reason: &str) {
        let failed = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            store.gates.remove(parent_id);
            match store.jobs.get_mut(parent_id) {
                Some(parent) if !parent.state.is_terminal() => {
                    parent.state = JobState::Failed;
                    parent.failed_reason =
                        Some(format!("child {} failed: {}", child_id, reason));
                    parent.finished_on = Some(chrono::Utc::now().timestamp_millis());
                    Some(parent.failed_reason.clone())
                }
                _ => None,
            }
        };
        if let Some(reason) = failed {
            let mut event = JobEvent::new(EventKind::Failed, parent_id);
            event.failed_reason = reason;
            self.inner.events.emit(event);
        }
    }

    /// Children values recorded for a parent job on this queue.
    pub(crate) fn children_values(&self, parent_id: &JobId) -> HashMap<JobId, serde_json::Value> {
        let store = self.inner.store.lock().expect("queue store lock");
        store
            .gates
            .get(parent_id)
            .map(|gate| gate.values.clone())
            .unwrap_or_default()
    }

    /// Claim the next runnable job for a worker.
    ///
    /// Promotes delayed jobs whose deadline passed, then claims the waiting
    /// job with the highest priority (FIFO within a priority). The claimed job
    /// is marked active, its attempt counter bumped, and a `started` event
    /// emitted.
    pub fn next_ready(&self) -> NextReady {
        let claimed = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            let now = Instant::now();

            // Promote due delayed jobs
            let due: Vec<JobId> = store
                .delayed_until
                .iter()
                .filter(|(_, at)| **at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            for id in due {
                store.delayed_until.remove(&id);
                if let Some(job) = store.jobs.get_mut(&id) {
                    if job.state == JobState::Delayed {
                        job.state = JobState::Waiting;
                    }
                }
            }

            // Highest priority first, then oldest
            let next_id = store
                .jobs
                .values()
                .filter(|j| j.state == JobState::Waiting)
                .max_by(|a, b| {
                    a.opts
                        .priority
                        .cmp(&b.opts.priority)
                        .then(b.timestamp.cmp(&a.timestamp))
                })
                .map(|j| j.id.clone());

            match next_id {
                Some(id) => {
                    let job = store.jobs.get_mut(&id).expect("claimed job exists");
                    job.state = JobState::Active;
                    job.attempts_made += 1;
                    Some(job.clone())
                }
                None => {
                    let deadline = store.delayed_until.values().min().copied();
                    return NextReady::Idle(deadline);
                }
            }
        };

        match claimed {
            Some(job) => {
                self.inner.events.emit(JobEvent::new(EventKind::Started, &job.id));
                NextReady::Job(job)
            }
            None => NextReady::Idle(None),
        }
    }

    /// Wait until the queue may have runnable work again.
    pub async fn idle(&self, deadline: Option<Instant>) {
        match deadline {
            Some(at) => {
                tokio::select! {
                    _ = self.inner.wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {}
                }
            }
            None => self.inner.wake.notified().await,
        }
    }

    /// Mark a job completed and emit the event. Returns the parent reference
    /// for fan-in notification, if the job gated one.
    pub fn complete(&self, job_id: &JobId, return_value: serde_json::Value) -> Option<ParentRef> {
        let (parent, emitted) = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            let Some(job) = store.jobs.get_mut(job_id) else {
                return None;
            };
            job.state = JobState::Completed;
            job.return_value = Some(return_value.clone());
            job.finished_on = Some(chrono::Utc::now().timestamp_millis());
            let parent = job.parent.clone();
            let remove = job.opts.remove_on_complete;
            let dedup_key = job.opts.deduplication.as_ref().map(|d| d.id.clone());
            if let Some(key) = dedup_key {
                store.dedup.remove(&key);
            }
            if remove {
                store.jobs.remove(job_id);
            }
            (parent, return_value)
        };

        let mut event = JobEvent::new(EventKind::Completed, job_id);
        event.return_value = Some(emitted);
        self.inner.events.emit(event);
        parent
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Returns the disposition and, when the failure is terminal, the parent
    /// reference for fan-in notification.
    pub fn fail_attempt(
        &self,
        job_id: &JobId,
        reason: &str,
    ) -> (FailDisposition, Option<ParentRef>) {
        enum Action {
            Retry { attempts_made: u32, delay: std::time::Duration },
            DeadLetter { job: Job },
            Fail { attempts_made: u32, parent: Option<ParentRef> },
        }

        let action = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            let Some(job) = store.jobs.get_mut(job_id) else {
                return (FailDisposition::Failed, None);
            };
            job.failed_reason = Some(reason.to_string());

            if job.attempts_made < job.opts.attempts {
                let delay = job
                    .opts
                    .backoff
                    .map(|b| b.delay_for(job.attempts_made))
                    .unwrap_or_default();
                job.state = JobState::Delayed;
                let attempts_made = job.attempts_made;
                let id = job.id.clone();
                store.delayed_until.insert(id, Instant::now() + delay);
                Action::Retry { attempts_made, delay }
            } else {
                job.state = JobState::Failed;
                job.finished_on = Some(chrono::Utc::now().timestamp_millis());
                let dedup_key = job.opts.deduplication.as_ref().map(|d| d.id.clone());
                let snapshot = job.clone();
                if let Some(key) = dedup_key {
                    store.dedup.remove(&key);
                }
                let has_dlq = self
                    .inner
                    .dead_letter
                    .lock()
                    .expect("dead_letter lock")
                    .is_some();
                if has_dlq {
                    Action::DeadLetter { job: snapshot }
                } else {
                    Action::Fail {
                        attempts_made: snapshot.attempts_made,
                        parent: snapshot.parent,
                    }
                }
            }
        };

        match action {
            Action::Retry { attempts_made, delay } => {
                tracing::debug!(
                    queue = %self.inner.name,
                    job_id = %job_id,
                    attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retry scheduled"
                );
                let mut event = JobEvent::new(EventKind::Retrying, job_id);
                event.failed_reason = Some(reason.to_string());
                event.attempts_made = Some(attempts_made);
                self.inner.events.emit(event);
                self.inner.wake.notify_one();
                (FailDisposition::Retried, None)
            }
            Action::DeadLetter { job } => {
                let parent = job.parent.clone();
                let attempts_made = job.attempts_made;
                self.route_to_dead_letter(job);

                let mut event = JobEvent::new(EventKind::Failed, job_id);
                event.failed_reason = Some(reason.to_string());
                event.attempts_made = Some(attempts_made);
                self.inner.events.emit(event);
                (FailDisposition::DeadLettered, parent)
            }
            Action::Fail { attempts_made, parent } => {
                let mut event = JobEvent::new(EventKind::Failed, job_id);
                event.failed_reason = Some(reason.to_string());
                event.attempts_made = Some(attempts_made);
                self.inner.events.emit(event);
                (FailDisposition::Failed, parent)
            }
        }
    }

    /// Report execution progress for an active job.
    pub fn report_progress(&self, job_id: &JobId, progress: u8) {
        let mut event = JobEvent::new(EventKind::Progress, job_id);
        event.progress = Some(progress);
        self.inner.events.emit(event);
    }

    /// Append a processor log line to a job.
    pub fn append_log(&self, job_id: &JobId, line: &str) {
        let mut store = self.inner.store.lock().expect("queue store lock");
        if let Some(job) = store.jobs.get_mut(job_id) {
            job.logs.push(line.to_string());
        }
    }

    /// Best-effort revocation.
    ///
    /// A waiting or delayed job is marked revoked and a `failed` event with
    /// reason `"revoked"` is emitted. A job already executing or terminal
    /// cannot be revoked; the caller must treat that as "may still complete".
    pub fn revoke(&self, job_id: &JobId) -> (RevokeOutcome, Option<ParentRef>) {
        let revoked = {
            let mut store = self.inner.store.lock().expect("queue store lock");
            let Some(job) = store.jobs.get_mut(job_id) else {
                return (RevokeOutcome::NotFound, None);
            };
            match job.state {
                JobState::Waiting | JobState::Delayed => {
                    job.state = JobState::Revoked;
                    job.failed_reason = Some("revoked".to_string());
                    job.finished_on = Some(chrono::Utc::now().timestamp_millis());
                    let parent = job.parent.clone();
                    let dedup_key = job.opts.deduplication.as_ref().map(|d| d.id.clone());
                    let id = job.id.clone();
                    store.delayed_until.remove(&id);
                    if let Some(key) = dedup_key {
                        store.dedup.remove(&key);
                    }
                    Some(parent)
                }
                _ => None,
            }
        };

        match revoked {
            Some(parent) => {
                let mut event = JobEvent::new(EventKind::Failed, job_id);
                event.failed_reason = Some("revoked".to_string());
                self.inner.events.emit(event);
                (RevokeOutcome::Revoked, parent)
            }
            None => (RevokeOutcome::TooLate, None),
        }
    }

    /// Fetch a job snapshot by id.
    pub fn get_job(&self, job_id: &JobId) -> Option<Job> {
        let store = self.inner.store.lock().expect("queue store lock");
        store.jobs.get(job_id).cloned()
    }

    /// Jobs currently in the given state, most recently finished/created
    /// first, capped at `limit`.
    pub fn get_jobs(&self, state: JobState, limit: usize) -> Vec<Job> {
        let store = self.inner.store.lock().expect("queue store lock");
        let mut jobs: Vec<Job> = store
            .jobs
            .values()
            .filter(|j| j.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.finished_on.unwrap_or(j.timestamp)));
        jobs.truncate(limit);
        jobs
    }

    /// Job counts for the dashboard.
    pub fn counts(&self) -> JobCounts {
        let store = self.inner.store.lock().expect("queue store lock");
        let mut counts = JobCounts::default();
        for job in store.jobs.values() {
            match job.state {
                JobState::Waiting | JobState::Delayed | JobState::WaitingChildren => {
                    counts.waiting += 1
                }
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed | JobState::Revoked => counts.failed += 1,
            }
        }
        counts
    }

    fn route_to_dead_letter(&self, failed: Job) {
        let dlq = self
            .inner
            .dead_letter
            .lock()
            .expect("dead_letter lock")
            .clone();
        let Some(dlq) = dlq else { return };

        let mut entry = Job::new(&failed.name, dlq.name(), failed.data.clone(), JobOptions::default());
        entry.failed_reason = failed.failed_reason.clone();
        entry.attempts_made = failed.attempts_made;
        entry.origin_queue = Some(self.inner.name.clone());
        tracing::warn!(
            queue = %self.inner.name,
            job_id = %failed.id,
            reason = failed.failed_reason.as_deref().unwrap_or("unknown"),
            "Job exhausted retries, routed to dead-letter queue"
        );
        dlq.insert(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::job::{Backoff, Deduplication};
    use serde_json::json;

    fn claim(queue: &Queue) -> Job {
        match queue.next_ready() {
            NextReady::Job(job) => job,
            NextReady::Idle(_) => panic!("expected a runnable job"),
        }
    }

    #[tokio::test]
    async fn test_add_and_claim() {
        let queue = Queue::new("test");
        let added = queue.add("work", json!({"k": 1}), JobOptions::default());
        assert_eq!(added.state, JobState::Waiting);

        let claimed = claim(&queue);
        assert_eq!(claimed.id, added.id);
        assert_eq!(claimed.state, JobState::Active);
        assert_eq!(claimed.attempts_made, 1);
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = Queue::new("test");
        queue.add("low", json!({}), JobOptions::default());
        let high = queue.add(
            "high",
            json!({}),
            JobOptions {
                priority: 10,
                ..Default::default()
            },
        );
        assert_eq!(claim(&queue).id, high.id);
    }

    #[tokio::test]
    async fn test_dedup_coalesces_to_existing() {
        let queue = Queue::new("test");
        let opts = JobOptions {
            deduplication: Some(Deduplication {
                id: "ord_1".to_string(),
            }),
            ..Default::default()
        };
        let first = queue.add("reserve", json!({}), opts.clone());
        let second = queue.add("reserve", json!({}), opts.clone());
        assert_eq!(first.id, second.id);

        // After the job completes, the key is released
        let active = claim(&queue);
        queue.complete(&active.id, json!({"reserved": true}));
        let third = queue.add("reserve", json!({}), opts);
        assert_ne!(third.id, first.id);
    }

    #[tokio::test]
    async fn test_retry_then_exhaustion() {
        let queue = Queue::new("test");
        queue.add(
            "flaky",
            json!({}),
            JobOptions {
                attempts: 2,
                backoff: Some(Backoff::Fixed { delay_ms: 0 }),
                ..Default::default()
            },
        );

        let first = claim(&queue);
        let (disposition, _) = queue.fail_attempt(&first.id, "boom");
        assert_eq!(disposition, FailDisposition::Retried);

        let second = claim(&queue);
        assert_eq!(second.attempts_made, 2);
        let (disposition, _) = queue.fail_attempt(&second.id, "boom again");
        assert_eq!(disposition, FailDisposition::Failed);
        assert_eq!(queue.get_job(&second.id).unwrap().state, JobState::Failed);
    }

    #[tokio::test]
    async fn test_exhaustion_routes_to_dead_letter() {
        let dlq = Queue::new("dead-letter");
        let queue = Queue::new("payment").with_dead_letter(dlq.clone());
        queue.add("charge", json!({"orderId": "ord_1"}), JobOptions::default());

        let job = claim(&queue);
        let (disposition, _) = queue.fail_attempt(&job.id, "declined");
        assert_eq!(disposition, FailDisposition::DeadLettered);

        let entries = dlq.get_jobs(JobState::Waiting, 10);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].origin_queue.as_deref(), Some("payment"));
        assert_eq!(entries[0].failed_reason.as_deref(), Some("declined"));
    }

    #[tokio::test]
    async fn test_revoke_waiting_job() {
        let queue = Queue::new("test");
        let job = queue.add("work", json!({}), JobOptions::default());
        let mut rx = queue.subscribe_events();

        let (outcome, _) = queue.revoke(&job.id);
        assert_eq!(outcome, RevokeOutcome::Revoked);
        assert_eq!(queue.get_job(&job.id).unwrap().state, JobState::Revoked);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Failed);
        assert_eq!(event.failed_reason.as_deref(), Some("revoked"));
    }

    #[tokio::test]
    async fn test_revoke_active_job_is_too_late() {
        let queue = Queue::new("test");
        queue.add("work", json!({}), JobOptions::default());
        let active = claim(&queue);

        let (outcome, _) = queue.revoke(&active.id);
        assert_eq!(outcome, RevokeOutcome::TooLate);

        let (outcome, _) = queue.revoke(&"missing".to_string());
        assert_eq!(outcome, RevokeOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_remove_on_complete_discards_record() {
        let queue = Queue::new("test");
        let job = queue.add(
            "ephemeral",
            json!({}),
            JobOptions {
                remove_on_complete: true,
                ..Default::default()
            },
        );
        let active = claim(&queue);
        assert_eq!(active.id, job.id);
        queue.complete(&active.id, json!({"ok": true}));
        assert!(queue.get_job(&job.id).is_none());
    }

    #[tokio::test]
    async fn test_counts() {
        let queue = Queue::new("test");
        queue.add("a", json!({}), JobOptions::default());
        queue.add("b", json!({}), JobOptions::default());
        let active = claim(&queue);
        queue.complete(&active.id, json!(null));

        let counts = queue.counts();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
        assert_eq!(counts.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_job_promotes_after_deadline() {
        let queue = Queue::new("test");
        queue.add(
            "later",
            json!({}),
            JobOptions {
                delay_ms: Some(1_000),
                ..Default::default()
            },
        );

        let deadline = match queue.next_ready() {
            NextReady::Idle(deadline) => deadline.expect("delayed deadline"),
            NextReady::Job(_) => panic!("job should still be delayed"),
        };
        tokio::time::sleep_until(deadline).await;

        let job = claim(&queue);
        assert_eq!(job.name, "later");
    }
}
