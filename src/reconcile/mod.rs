//! Event reconciliation engine
//!
//! Consumes the unordered, at-least-once lifecycle event stream and
//! reconstructs a consistent per-order state machine. One engine instance is
//! owned by each observer connection; engines never share mutable state.
//!
//! The state machine itself is a pure reducer over tagged [`StageMessage`]s,
//! so transition behavior is deterministic and replayable independent of the
//! transport: applying the same event twice, or delivering events out of
//! order, converges on the same terminal state.

use crate::broker::{EventKind, JobEvent, JobId};
use crate::pipeline::stages::{Stage, PIPELINE_QUEUE};
use serde::Serialize;
use std::collections::HashMap;
use tracing::trace;

/// Reconciled state of one pipeline stage for one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    /// No event observed yet
    Idle,
    /// The stage's job is enqueued or executing
    Active,
    /// The stage failed and will be retried
    Retrying,
    /// The stage finished successfully (sticky)
    Completed,
    /// The stage failed terminally
    Failed,
}

/// Client-visible overall order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Submitted, no stage activity observed yet
    Pending,
    /// At least one stage is in flight
    Processing,
    /// Every stage completed
    Completed,
    /// At least one stage failed terminally
    Failed,
}

/// One entry of an order's human-readable transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// When the transition was observed, milliseconds since the epoch
    pub timestamp: i64,
    /// What happened
    pub text: String,
}

/// Reconciled, client-visible state of one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderState {
    /// Order identifier
    #[serde(rename = "orderId")]
    pub order_id: String,
    /// Per-stage states
    pub stages: HashMap<Stage, StageState>,
    /// Overall status
    pub status: OrderStatus,
    /// Payment retry counter
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
    /// Ordered transition log
    pub log: Vec<LogEntry>,
}

impl OrderState {
    /// Fresh state: every stage idle, status pending.
    pub fn new(order_id: &str) -> Self {
        Self {
            order_id: order_id.to_string(),
            stages: Stage::ALL.iter().map(|s| (*s, StageState::Idle)).collect(),
            status: OrderStatus::Pending,
            retry_count: 0,
            log: Vec::new(),
        }
    }

    /// Whether every stage in the registry is completed.
    pub fn all_stages_completed(&self) -> bool {
        Stage::ALL
            .iter()
            .all(|s| self.stages.get(s) == Some(&StageState::Completed))
    }

    fn append_log(&mut self, text: String) {
        self.log.push(LogEntry {
            timestamp: chrono::Utc::now().timestamp_millis(),
            text,
        });
    }

    /// Set a stage's state, honoring completed-stickiness. Returns whether a
    /// transition actually happened.
    fn set_stage(&mut self, stage: Stage, new: StageState) -> bool {
        let current = self.stages.get(&stage).copied().unwrap_or(StageState::Idle);
        if current == StageState::Completed || current == new {
            return false;
        }
        self.stages.insert(stage, new);
        true
    }
}

/// A lifecycle event resolved to a stage: the input of the pure reducer.
#[derive(Debug, Clone)]
pub struct StageMessage {
    /// Transition kind
    pub kind: EventKind,
    /// Stage the originating queue mapped to
    pub stage: Stage,
    /// Failure reason, if the event carried one
    pub failed_reason: Option<String>,
    /// Attempts made so far, if the event carried it
    pub attempts_made: Option<u32>,
}

impl StageMessage {
    /// Build a message from a raw event and its resolved stage.
    pub fn from_event(stage: Stage, event: &JobEvent) -> Self {
        Self {
            kind: event.kind,
            stage,
            failed_reason: event.failed_reason.clone(),
            attempts_made: event.attempts_made,
        }
    }
}

/// Pure transition function for one order.
///
/// `max_payment_attempts` bounds the payment retry interpretation: a payment
/// failure with `attempts_made + 1 < max` is a retry, anything else is
/// terminal. Transitions that would downgrade a completed stage are dropped,
/// which makes the reducer idempotent under replay and tolerant of
/// out-of-order delivery.
pub fn reduce(mut state: OrderState, msg: &StageMessage, max_payment_attempts: u32) -> OrderState {
    match msg.kind {
        EventKind::Enqueued | EventKind::Started => {
            if state.set_stage(msg.stage, StageState::Active) {
                state.append_log(format!("{} processing", msg.stage.key()));
            }
            if state.status == OrderStatus::Pending || state.status == OrderStatus::Failed {
                state.status = OrderStatus::Processing;
            }
        }
        EventKind::Completed => {
            if state.set_stage(msg.stage, StageState::Completed) {
                state.append_log(format!("{} completed", msg.stage.key()));
                state.status = if state.all_stages_completed() {
                    OrderStatus::Completed
                } else {
                    OrderStatus::Processing
                };
            }
        }
        EventKind::Failed => {
            let retryable = msg.stage == Stage::Payment
                && msg
                    .attempts_made
                    .map(|made| made + 1 < max_payment_attempts)
                    .unwrap_or(false);
            if retryable {
                if state.stages.get(&msg.stage) != Some(&StageState::Completed) {
                    // The counter derives from attemptsMade, not from how many
                    // events arrived: consecutive failures without an
                    // intervening started still advance it, and replays do
                    // not inflate it.
                    let attempt = (msg.attempts_made.unwrap_or(0) + 1).max(state.retry_count);
                    let stage_changed = state.set_stage(msg.stage, StageState::Retrying);
                    if stage_changed || attempt != state.retry_count {
                        state.retry_count = attempt;
                        state.append_log(format!(
                            "payment will retry (attempt {}/{})",
                            attempt, max_payment_attempts
                        ));
                    }
                }
            } else if state.set_stage(msg.stage, StageState::Failed) {
                let reason = msg.failed_reason.as_deref().unwrap_or("unknown");
                state.append_log(format!("{} failed: {}", msg.stage.key(), reason));
                state.status = OrderStatus::Failed;
            }
        }
        EventKind::Retrying => {
            if state.stages.get(&msg.stage) != Some(&StageState::Completed) {
                let attempt = msg.attempts_made.unwrap_or(state.retry_count + 1).max(state.retry_count);
                let stage_changed = state.set_stage(msg.stage, StageState::Retrying);
                if stage_changed || attempt != state.retry_count {
                    state.retry_count = attempt;
                    state.append_log(format!(
                        "{} retrying (attempt {})",
                        msg.stage.key(),
                        state.retry_count
                    ));
                    state.status = OrderStatus::Processing;
                }
            }
        }
        EventKind::Progress => {
            // log-only at trace level; no state change
            trace!(order_id = %state.order_id, stage = msg.stage.key(), "progress");
        }
    }
    state
}

/// Mapping from broker job identifier to order identifier.
///
/// Populated at submission time (each observer copies entries from the
/// process-wide submission registry) and consulted to resolve incoming
/// events. Entries may be pruned once an order is terminal to bound growth.
#[derive(Debug, Clone, Default)]
pub struct CorrelationTable {
    map: HashMap<JobId, String>,
}

impl CorrelationTable {
    /// Record a job -> order correlation.
    pub fn insert(&mut self, job_id: &JobId, order_id: &str) {
        self.map.insert(job_id.clone(), order_id.to_string());
    }

    /// Resolve a job id to its order id.
    pub fn resolve(&self, job_id: &JobId) -> Option<&str> {
        self.map.get(job_id).map(String::as_str)
    }

    /// Drop every entry pointing at the given order. Returns how many were
    /// removed.
    pub fn prune_order(&mut self, order_id: &str) -> usize {
        let before = self.map.len();
        self.map.retain(|_, v| v != order_id);
        before - self.map.len()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Per-observer reconciliation engine: a correlation table plus the order
/// state map, driven by relayed lifecycle events.
pub struct ReconciliationEngine {
    max_payment_attempts: u32,
    correlation: CorrelationTable,
    orders: HashMap<String, OrderState>,
}

impl ReconciliationEngine {
    /// Create an engine. `max_payment_attempts` must match the orchestrator's
    /// payment retry bound for exhaustion to be classified correctly.
    pub fn new(max_payment_attempts: u32) -> Self {
        Self {
            max_payment_attempts,
            correlation: CorrelationTable::default(),
            orders: HashMap::new(),
        }
    }

    /// Record a job -> order correlation (copied from the submission
    /// registry, never aliased).
    pub fn register(&mut self, job_id: &JobId, order_id: &str) {
        self.correlation.insert(job_id, order_id);
    }

    /// Whether a job id is already resolvable.
    pub fn knows_job(&self, job_id: &JobId) -> bool {
        self.correlation.resolve(job_id).is_some()
    }

    /// Reconciled state for one order.
    pub fn order(&self, order_id: &str) -> Option<&OrderState> {
        self.orders.get(order_id)
    }

    /// All reconciled orders.
    pub fn orders(&self) -> &HashMap<String, OrderState> {
        &self.orders
    }

    /// Interpret one relayed event.
    ///
    /// Returns the updated order state when the event resolved to an order,
    /// `None` when it was dropped (unknown job, expected for events racing
    /// with submission) or was informative only.
    pub fn apply(&mut self, queue: &str, event: &JobEvent) -> Option<&OrderState> {
        let order_id = match self.correlation.resolve(&event.job_id) {
            Some(order_id) => order_id.to_string(),
            None => {
                // Expected race: event arrived before (or after pruning of)
                // its submission record. Never an error.
                trace!(queue, job_id = %event.job_id, "Dropping event for unknown job");
                return None;
            }
        };

        let Some(stage) = Stage::for_queue(queue) else {
            // Pipeline (or dead-letter) queue events are informative only:
            // they signal the continuation chain, not a stage transition.
            if queue == PIPELINE_QUEUE && event.kind == EventKind::Completed {
                let state = self
                    .orders
                    .entry(order_id.clone())
                    .or_insert_with(|| OrderState::new(&order_id));
                let marker = "fulfillment chain triggered";
                if !state.log.iter().any(|e| e.text == marker) {
                    state.append_log(marker.to_string());
                }
            }
            return self.orders.get(&order_id);
        };

        let msg = StageMessage::from_event(stage, event);
        let state = self
            .orders
            .remove(&order_id)
            .unwrap_or_else(|| OrderState::new(&order_id));
        let next = reduce(state, &msg, self.max_payment_attempts);
        self.orders.insert(order_id.clone(), next);
        self.orders.get(&order_id)
    }

    /// Prune correlation entries for completed orders (bounded-growth
    /// concern). Failed orders keep their entries so late completions can
    /// still reconcile.
    pub fn prune_completed(&mut self) -> usize {
        let completed: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Completed)
            .map(|o| o.order_id.clone())
            .collect();
        completed
            .iter()
            .map(|id| self.correlation.prune_order(id))
            .sum()
    }
}
