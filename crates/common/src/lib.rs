//! Shared vocabulary for the reindex pipeline: identifier and watermark
//! newtypes, transaction records, tunable knobs, and backoff.

pub mod backoff;
pub mod env;
pub mod knobs;
pub mod types;
