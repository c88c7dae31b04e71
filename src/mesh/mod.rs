//! The store-and-forward packet pipeline.

pub mod dedup;
pub mod parked;
pub mod pipeline;
pub mod queue;

pub use dedup::DedupCache;
pub use parked::ParkedQueue;
pub use pipeline::{Pipeline, PipelineCommand, PipelineContext};
pub use queue::{EgressTarget, PriorityQueue};
