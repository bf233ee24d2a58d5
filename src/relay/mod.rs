//! Event relay
//!
//! Bridges every queue's broadcast channel into one merged stream per
//! observer. Each SSE connection owns its own [`EventRelay`]; dropping the
//! relay tears down all its subscriptions, whether the client disconnected
//! cleanly or the connection broke.

use crate::broker::{Broker, JobEvent};
use crate::pipeline::all_queue_names;
use serde::Serialize;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::warn;

/// A lifecycle event tagged with the queue it came from: the unit of the
/// client-facing stream.
#[derive(Debug, Clone, Serialize)]
pub struct RelayedEvent {
    /// Queue the event was emitted on
    pub queue: String,
    /// The event itself, flattened into the same JSON object
    #[serde(flatten)]
    pub event: JobEvent,
}

/// Merged subscription over every queue the broker operates.
///
/// Delivery is at-least-once per subscription with no cross-queue ordering;
/// an observer that falls behind a queue's channel capacity skips ahead and
/// misses events. Downstream reconciliation tolerates both.
pub struct EventRelay {
    streams: StreamMap<String, BroadcastStream<JobEvent>>,
}

impl EventRelay {
    /// Subscribe to every queue. Missing queues are skipped; the broker's
    /// queue set is fixed at startup, so in practice all seven are present.
    pub fn new(broker: &Broker) -> Self {
        let mut streams = StreamMap::new();
        for name in all_queue_names() {
            if let Some(queue) = broker.queue(name) {
                streams.insert(
                    name.to_string(),
                    BroadcastStream::new(queue.subscribe_events()),
                );
            }
        }
        Self { streams }
    }

    /// Number of queues this relay is subscribed to.
    pub fn queue_count(&self) -> usize {
        self.streams.len()
    }

    /// Next event from any subscribed queue. Lagged subscriptions are skipped
    /// with a warning, never an error to the client. Returns `None` only if
    /// every sending half is gone.
    pub async fn next_event(&mut self) -> Option<RelayedEvent> {
        loop {
            match self.streams.next().await? {
                (queue, Ok(event)) => return Some(RelayedEvent { queue, event }),
                (queue, Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    warn!(queue = %queue, missed, "Event relay lagged, skipping ahead");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{EventKind, JobOptions, Queue};
    use serde_json::json;
    use std::time::Duration;

    fn pipeline_broker() -> Broker {
        Broker::new(all_queue_names().into_iter().map(Queue::new).collect())
    }

    #[tokio::test]
    async fn test_relay_subscribes_to_every_queue() {
        let relay = EventRelay::new(&pipeline_broker());
        assert_eq!(relay.queue_count(), 7);
    }

    #[tokio::test]
    async fn test_relay_tags_events_with_queue() {
        let broker = pipeline_broker();
        let mut relay = EventRelay::new(&broker);

        let job = broker
            .queue("payment")
            .unwrap()
            .add("charge", json!({"orderId": "ord_1"}), JobOptions::default());

        let relayed = tokio::time::timeout(Duration::from_secs(1), relay.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relayed.queue, "payment");
        assert_eq!(relayed.event.kind, EventKind::Enqueued);
        assert_eq!(relayed.event.job_id, job.id);
    }

    #[tokio::test]
    async fn test_relay_merges_multiple_queues() {
        let broker = pipeline_broker();
        let mut relay = EventRelay::new(&broker);

        broker
            .queue("payment")
            .unwrap()
            .add("charge", json!({}), JobOptions::default());
        broker
            .queue("inventory")
            .unwrap()
            .add("reserve", json!({}), JobOptions::default());

        let mut seen = Vec::new();
        for _ in 0..2 {
            let relayed = tokio::time::timeout(Duration::from_secs(1), relay.next_event())
                .await
                .unwrap()
                .unwrap();
            seen.push(relayed.queue);
        }
        seen.sort();
        assert_eq!(seen, vec!["inventory", "payment"]);
    }

    #[test]
    fn test_relayed_event_flattens_on_the_wire() {
        let relayed = RelayedEvent {
            queue: "payment".to_string(),
            event: JobEvent::new(EventKind::Started, "job-1"),
        };
        let value = serde_json::to_value(&relayed).unwrap();
        assert_eq!(value["queue"], "payment");
        assert_eq!(value["type"], "started");
        assert_eq!(value["jobId"], "job-1");
    }
}
