//! Embedded storage for the proposal log and the KV-backed timestamp bound.
//!
//! Everything durable in a timelock node lives in one redb file per node:
//!
//! - **Proposal log**: promised rounds and accepted proposals, one tree per
//!   log namespace (see [`crate::paxos::RedbProposalLog`])
//! - **Timestamp bound** (external-KV mode only): a single compare-and-swap
//!   cell (see [`crate::timestamp::KvBoundStore`])
//!
//! # Example
//!
//! ```rust,ignore
//! use timelock::storage::RedbStore;
//!
//! let store = RedbStore::open("/var/lib/timelock/paxos.redb")?;
//! let tree = store.tree("paxos_accepted_leadership")?;
//! tree.set(&7u64.to_be_bytes(), b"proposal")?;
//! ```

mod redb_store;

pub use redb_store::{RedbStore, RedbTree, Result, StorageError, StoreBatch};
