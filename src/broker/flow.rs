//! Flow producer: atomic parent + children job graphs
//!
//! A flow is one parent job gated on a set of concurrent children. The parent
//! only becomes runnable once every child has completed; any child reaching a
//! terminal non-success state fails the parent instead.

use crate::broker::job::{Job, JobOptions, JobState, ParentRef};
use crate::broker::Broker;
use thiserror::Error;

/// A child job within a flow.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Job name
    pub name: String,
    /// Queue the child is submitted to
    pub queue: String,
    /// Child payload
    pub data: serde_json::Value,
    /// Child submission options
    pub opts: JobOptions,
}

/// A parent job plus its concurrent children.
#[derive(Debug, Clone)]
pub struct FlowSpec {
    /// Parent job name
    pub name: String,
    /// Queue the parent is submitted to
    pub queue: String,
    /// Parent payload
    pub data: serde_json::Value,
    /// Concurrent children gating the parent
    pub children: Vec<ChildSpec>,
}

/// Jobs created by a flow submission.
#[derive(Debug, Clone)]
pub struct FlowHandle {
    /// The parent job (gated on the children)
    pub parent: Job,
    /// The child jobs, in spec order. A child that was coalesced onto an
    /// existing job by deduplication appears as that existing job.
    pub children: Vec<Job>,
}

/// Errors raised at flow submission time.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A queue named by the spec does not exist on this broker
    #[error("unknown queue: {0}")]
    UnknownQueue(String),
    /// A flow must have at least one child
    #[error("flow has no children")]
    NoChildren,
}

/// Submits parent+children graphs atomically.
#[derive(Clone)]
pub struct FlowProducer {
    broker: Broker,
}

impl FlowProducer {
    /// Create a producer over the broker's queues.
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Submit a flow.
    ///
    /// Every queue named by the spec is validated before anything is
    /// inserted, so either the full graph is accepted or the call fails with
    /// no partial graph left behind.
    pub fn add(&self, spec: FlowSpec) -> Result<FlowHandle, FlowError> {
        if spec.children.is_empty() {
            return Err(FlowError::NoChildren);
        }

        // Validate the whole graph up front: queue resolution is the only
        // thing that can fail, so checking it first makes submission atomic.
        let parent_queue = self
            .broker
            .queue(&spec.queue)
            .ok_or_else(|| FlowError::UnknownQueue(spec.queue.clone()))?;
        let mut child_queues = Vec::with_capacity(spec.children.len());
        for child in &spec.children {
            let queue = self
                .broker
                .queue(&child.queue)
                .ok_or_else(|| FlowError::UnknownQueue(child.queue.clone()))?;
            child_queues.push(queue);
        }

        // Parent goes in first, gated, so no child completion can race it.
        let mut parent = Job::new(&spec.name, &spec.queue, spec.data, JobOptions::default());
        parent.state = JobState::WaitingChildren;
        let parent = parent_queue.insert(parent);
        parent_queue.register_gate(&parent.id, spec.children.len());

        let mut children = Vec::with_capacity(spec.children.len());
        for (child, queue) in spec.children.into_iter().zip(child_queues) {
            let mut job = Job::new(&child.name, &child.queue, child.data, child.opts);
            job.parent = Some(ParentRef {
                queue: spec.queue.clone(),
                id: parent.id.clone(),
            });
            let new_id = job.id.clone();
            let inserted = queue.insert(job);

            if inserted.id != new_id {
                // Deduplication coalesced this child onto a job owned by an
                // earlier flow. The new parent's gate is satisfied
                // immediately; the live job keeps reporting to its own parent.
                parent_queue.child_completed(
                    &parent.id,
                    &inserted.id,
                    serde_json::json!({ "deduplicated": true, "jobId": inserted.id }),
                );
            }
            children.push(inserted);
        }

        Ok(FlowHandle { parent, children })
    }
}
