//! Timelock: Replicated Timestamp and Lock Service
//!
//! This crate provides:
//!
//! 1. **Paxos** ([`paxos`]): per-round single-decree Paxos over two durable
//!    logs, used to elect a leased leader and to agree timestamp bounds.
//!
//! 2. **Timestamps** ([`timestamp`]): strictly increasing timestamps served
//!    from in-memory batches whose upper bound is durably reserved first.
//!
//! 3. **Locks** ([`lock`]): named shared/exclusive locks with FIFO queuing,
//!    blocking-with-timeout acquisition and term-fenced tokens.
//!
//! 4. **Availability gate** ([`gate`]): the node serves `NotInitialized`
//!    until its backing store becomes reachable, then opens once.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  timelock crate                                                 │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  node module (facade)                                   │   │
//! │  │                                                         │   │
//! │  │  TimelockNode ──┬──► TimestampService ──► BoundStore    │   │
//! │  │                 ├──► LockManager                        │   │
//! │  │                 └──► AvailabilityGate                   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  paxos module                                           │   │
//! │  │                                                         │   │
//! │  │  LeaderElector ─┬──► Proposer ──► AcceptorClient (N)    │   │
//! │  │  PaxosBoundStore┘                    │                  │   │
//! │  │                              Acceptor ──► ProposalLog   │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! │                                                                 │
//! │  ┌─────────────────────────────────────────────────────────┐   │
//! │  │  storage module (redb)                                  │   │
//! │  │                                                         │   │
//! │  │  RedbStore ─────┬──► Proposal log (promises, accepts)   │   │
//! │  │                 └──► KV timestamp bound cell            │   │
//! │  └─────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use timelock::config::TimelockConfig;
//! use timelock::node::TimelockNode;
//!
//! # async fn run() -> timelock::Result<()> {
//! let config = TimelockConfig::load("/etc/timelock/timelock.json")?;
//! let node = TimelockNode::from_config(&config, Vec::new())?;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let _tasks = node.start(shutdown_rx);
//!
//! let ts = node.get_fresh_timestamp().await?;
//! println!("fresh timestamp: {}", ts);
//! let _ = shutdown_tx.send(true);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: JSON install configuration
//! - [`error`]: Client-visible error taxonomy
//! - [`gate`]: Readiness gate and background initializer
//! - [`lock`]: Lock manager
//! - [`node`]: Node facade wiring everything together
//! - [`paxos`]: Proposal logs, acceptor, proposer, leader election
//! - [`storage`]: Embedded key-value storage (redb-based)
//! - [`timestamp`]: Timestamp allocator and bound stores

pub mod config;
pub mod error;
pub mod gate;
pub mod lock;
pub mod node;
pub mod paxos;
pub mod storage;
pub mod timestamp;

#[cfg(test)]
mod testing;

pub use error::{Result, TimelockError};

/// Re-export commonly used types for convenience.
pub mod prelude {
    pub use crate::config::TimelockConfig;
    pub use crate::error::{Result, TimelockError};
    pub use crate::lock::{LockMode, LockToken};
    pub use crate::node::TimelockNode;
    pub use crate::paxos::{Acceptor, AcceptorClient, NodeId, Term};
    pub use crate::timestamp::TimestampRange;
}
