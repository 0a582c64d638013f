//! Shared/exclusive locks with blocking-with-timeout acquisition.
//!
//! Per lock name: `UNLOCKED -> HELD(mode, holders) -> UNLOCKED`. Exclusive
//! admits one holder; shared admits any number of shared holders. Waiters are
//! served strictly in arrival order, and every token is fenced to the
//! leadership term that granted it.

mod manager;
mod model;

pub use manager::{LockConfig, LockManager};
pub use model::{LockMode, LockRequest, LockToken};
