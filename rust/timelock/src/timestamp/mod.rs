//! Timestamp service: batched allocation over a durable upper bound.
//!
//! The leader serves timestamps from an in-memory batch and consults
//! consensus (or the KV bound cell) only to reserve the next batch.

mod allocator;
mod bound_store;

pub use allocator::{AllocatorConfig, TimestampBatch, TimestampRange, TimestampService};
pub use bound_store::{
    DeferredBoundStore, KvBoundStore, PaxosBoundStore, TimestampBoundStore, BOUND_KEY, BOUND_TREE, INITIAL_TIMESTAMP,
};
