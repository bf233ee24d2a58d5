//! Lifecycle events emitted by queues
//!
//! Every queue owns a broadcast channel of [`JobEvent`]s. Events are ephemeral:
//! an observer that subscribes late or falls behind misses events, which the
//! reconciliation layer is designed to tolerate.

use crate::broker::job::JobId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Capacity of each queue's broadcast channel. Observers that lag more than
/// this many events skip ahead.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Kind of lifecycle transition an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Job was accepted onto the queue
    Enqueued,
    /// A worker began executing the job
    Started,
    /// The job finished successfully
    Completed,
    /// The job finished unsuccessfully
    Failed,
    /// The job failed but will be retried after backoff
    Retrying,
    /// The processor reported execution progress
    Progress,
}

/// One lifecycle event for one job.
///
/// Within a single job's lifecycle, `Started` always precedes that job's own
/// `Completed`/`Failed`. Across queues no ordering is guaranteed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEvent {
    /// Transition kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Job the event refers to
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    /// Return value (completed events)
    #[serde(rename = "returnvalue", skip_serializing_if = "Option::is_none")]
    pub return_value: Option<serde_json::Value>,
    /// Failure reason (failed/retrying events)
    #[serde(rename = "failedReason", skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    /// Attempts made so far (failed/retrying events)
    #[serde(rename = "attemptsMade", skip_serializing_if = "Option::is_none")]
    pub attempts_made: Option<u32>,
    /// Progress value 0-100 (progress events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
}

impl JobEvent {
    /// Build a bare event with no payload fields.
    pub fn new(kind: EventKind, job_id: &str) -> Self {
        Self {
            kind,
            job_id: job_id.to_string(),
            return_value: None,
            failed_reason: None,
            attempts_made: None,
            progress: None,
        }
    }
}

/// Sending half of a queue's event channel.
///
/// Cloneable handle; emitting never blocks and ignores the no-subscriber case.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: broadcast::Sender<JobEvent>,
}

impl EventSender {
    /// Create a new event channel.
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Emit an event to all current subscribers.
    pub fn emit(&self, event: JobEvent) {
        // send only errors when there are no subscribers
        let _ = self.tx.send(event);
    }

    /// Open a new subscription receiving events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let sender = EventSender::new();
        let mut rx = sender.subscribe();

        sender.emit(JobEvent::new(EventKind::Started, "job-1"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Started);
        assert_eq!(event.job_id, "job-1");
    }

    #[test]
    fn test_emit_without_subscribers_is_ok() {
        let sender = EventSender::new();
        sender.emit(JobEvent::new(EventKind::Completed, "job-1"));
    }

    #[test]
    fn test_event_wire_format() {
        let mut event = JobEvent::new(EventKind::Failed, "job-9");
        event.failed_reason = Some("declined".to_string());
        event.attempts_made = Some(2);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "failed");
        assert_eq!(value["jobId"], "job-9");
        assert_eq!(value["failedReason"], "declined");
        assert_eq!(value["attemptsMade"], 2);
        // absent payload fields are omitted entirely
        assert!(value.get("returnvalue").is_none());
        assert!(value.get("progress").is_none());
    }
}
