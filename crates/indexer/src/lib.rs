//! The invalidation-and-reindex pipeline.
//!
//! One cycle: drain priority requests and undone work, translate committed
//! transactions into an invalidation set, pin a primary-store snapshot, fan
//! the set out to a worker pool that renders and writes documents with
//! external versioning, then durably record the outcome in the search store
//! itself and stage hand-offs for follow-up indexers.

pub mod controller;
pub mod embed;
pub mod queue;
pub mod resolver;
pub mod state;
pub mod worker;

#[cfg(test)]
mod tests;

pub use controller::{
    CycleController,
    CycleOutcome,
    IndexRequest,
};
pub use state::CycleState;
