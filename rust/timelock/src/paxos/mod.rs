//! Round-based agreement: proposal log, acceptor, proposer and leader election.
//!
//! Each acceptor keeps one independent log per [`LogNamespace`]. Every round
//! of a log is a single-decree decision: an acceptor accepts at most one value
//! per round and never participates in a round below one it has already
//! promised, so at most one value is ever chosen for a given (log, round).
//!
//! ```text
//!  ┌──────────────┐  prepare / accept / confirm_lease  ┌──────────────┐
//!  │ LeaderElector├───────────┐                       │   Acceptor   │
//!  └──────────────┘           ▼                       │  (node 1..N) │
//!  ┌──────────────┐     ┌──────────┐  AcceptorClient  ├──────────────┤
//!  │PaxosBoundStore├───►│ Proposer ├─────────────────►│ ProposalLog  │
//!  └──────────────┘     └──────────┘                  │ (redb/memory)│
//!                                                     └──────────────┘
//! ```

mod acceptor;
mod elector;
mod log;
mod proposer;
mod types;

pub use acceptor::{Acceptor, AcceptorClient};
pub use elector::{ElectionConfig, LeaderElector, Leadership, LeadershipStatus, SoleLeader};
pub use log::{DeferredProposalLog, InMemoryProposalLog, ProposalLog, RedbProposalLog};
pub use proposer::{Proposer, RoundOutcome};
pub use types::{
    encode_term, AcceptOutcome, LogNamespace, NodeId, PrepareOutcome, Promise, Proposal, Reject,
    Round, Term,
};
