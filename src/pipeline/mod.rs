//! Order-fulfillment pipeline
//!
//! How one order becomes a graph of dependent jobs: the stage registry, the
//! flow orchestrator that submits the parent + concurrent children, the
//! continuation worker that fires the fulfillment chain, the toy stage
//! processors, and the dead-letter router.

pub mod continuation;
pub mod dead_letter;
pub mod orchestrator;
pub mod processors;
pub mod stages;

pub use continuation::ContinuationProcessor;
pub use dead_letter::{DeadLetterEntry, DeadLetterRouter};
pub use orchestrator::{
    CancelResult, ChildRef, Customer, FlowOrchestrator, LineItem, OrderPayload, OrderSubmission,
    SubmissionRegistry,
};
pub use stages::{all_queue_names, Stage, DEAD_LETTER_QUEUE, PIPELINE_QUEUE};
