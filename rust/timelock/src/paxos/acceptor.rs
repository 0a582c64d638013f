//! Paxos acceptor: answers `prepare` / `accept` against a [`ProposalLog`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::log::ProposalLog;
use super::types::{
    AcceptOutcome, LogNamespace, NodeId, PrepareOutcome, Promise, Proposal, Reject, Round, Term,
};
use crate::error::{Result, TimelockError};

/// The acceptor side of the protocol as seen by a proposer.
///
/// The in-process [`Acceptor`] implements it directly; a transport layer
/// implements it for remote peers.
#[async_trait]
pub trait AcceptorClient: Send + Sync {
    /// Node hosting this acceptor.
    fn node_id(&self) -> NodeId;

    async fn prepare(
        &self,
        ns: LogNamespace,
        round: Round,
        proposer: NodeId,
    ) -> Result<PrepareOutcome>;

    async fn accept(&self, ns: LogNamespace, proposal: Proposal) -> Result<AcceptOutcome>;

    /// Ask the acceptor to back `term` for `duration`. `Ok(true)` means the
    /// lease was recorded.
    async fn confirm_lease(&self, term: Term, duration: Duration) -> Result<bool>;

    async fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>>;
}

#[derive(Debug, Clone, Copy)]
struct Lease {
    term: Term,
    expires_at: Instant,
}

/// A single node's acceptor.
///
/// All state transitions happen under one mutex. The log write completes
/// before the mutex is released and before the response is returned.
pub struct Acceptor {
    node_id: NodeId,
    log: Arc<dyn ProposalLog>,
    lease: Mutex<Option<Lease>>,
}

impl Acceptor {
    pub fn new(node_id: NodeId, log: Arc<dyn ProposalLog>) -> Self {
        Self {
            node_id,
            log,
            lease: Mutex::new(None),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    fn storage_failure(op: &str, e: crate::storage::StorageError) -> TimelockError {
        tracing::warn!("proposal log {} failed: {}", op, e);
        TimelockError::from(e)
    }

    fn live_lease(lease: &Option<Lease>) -> Option<Term> {
        lease
            .as_ref()
            .filter(|l| Instant::now() < l.expires_at)
            .map(|l| l.term)
    }

    /// Handle a `prepare` for `round` of `ns`.
    pub fn handle_prepare(
        &self,
        ns: LogNamespace,
        round: Round,
        proposer: NodeId,
    ) -> Result<PrepareOutcome> {
        let lease = self.lease.lock();

        if ns == LogNamespace::Leadership {
            if let Some(term) = Self::live_lease(&lease) {
                if term.leader_id != proposer && round > term.number {
                    tracing::debug!(
                        "acceptor {} rejecting prepare {} from {}: lease held by {}",
                        self.node_id,
                        round,
                        proposer,
                        term
                    );
                    return Ok(PrepareOutcome::Rejected(Reject::LeaseHeld { term }));
                }
            }
        }

        let promised = self
            .log
            .promised(ns)
            .map_err(|e| Self::storage_failure("read", e))?;
        if round < promised {
            return Ok(PrepareOutcome::Rejected(Reject::Superseded { promised }));
        }

        let accepted = self
            .log
            .accepted(ns, round)
            .map_err(|e| Self::storage_failure("read", e))?;
        let highest_accepted_below = self
            .log
            .highest_accepted_below(ns, round)
            .map_err(|e| Self::storage_failure("read", e))?;

        if round > promised {
            self.log
                .record_promise(ns, round)
                .map_err(|e| Self::storage_failure("promise", e))?;
        }

        Ok(PrepareOutcome::Promised(Promise {
            accepted,
            highest_accepted_below,
        }))
    }

    /// Handle an `accept` of `proposal` in `ns`.
    pub fn handle_accept(&self, ns: LogNamespace, proposal: &Proposal) -> Result<AcceptOutcome> {
        let _lease = self.lease.lock();

        let promised = self
            .log
            .promised(ns)
            .map_err(|e| Self::storage_failure("read", e))?;
        if proposal.round < promised {
            return Ok(AcceptOutcome::Rejected(Reject::Superseded { promised }));
        }

        match self
            .log
            .accepted(ns, proposal.round)
            .map_err(|e| Self::storage_failure("read", e))?
        {
            Some(existing) if existing == *proposal => Ok(AcceptOutcome::Accepted),
            Some(existing) => Ok(AcceptOutcome::Rejected(Reject::Conflict { accepted: existing })),
            None => {
                self.log
                    .record_accept(ns, proposal)
                    .map_err(|e| Self::storage_failure("accept", e))?;
                Ok(AcceptOutcome::Accepted)
            }
        }
    }

    /// Back `term` until `now + duration` if it is the term this acceptor
    /// accepted and no higher round has been promised since.
    pub fn handle_confirm_lease(&self, term: Term, duration: Duration) -> Result<bool> {
        let received_at = Instant::now();
        let mut lease = self.lease.lock();

        let ns = LogNamespace::Leadership;
        let promised = self
            .log
            .promised(ns)
            .map_err(|e| Self::storage_failure("read", e))?;
        if promised > term.number {
            return Ok(false);
        }
        let backs_term = self
            .log
            .accepted(ns, term.number)
            .map_err(|e| Self::storage_failure("read", e))?
            .map_or(false, |p| p.proposer_id == term.leader_id);
        if !backs_term {
            return Ok(false);
        }

        *lease = Some(Lease {
            term,
            expires_at: received_at + duration,
        });
        Ok(true)
    }

    pub fn handle_highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>> {
        self.log
            .highest_accepted(ns)
            .map_err(|e| Self::storage_failure("read", e))
    }
}

#[async_trait]
impl AcceptorClient for Acceptor {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn prepare(
        &self,
        ns: LogNamespace,
        round: Round,
        proposer: NodeId,
    ) -> Result<PrepareOutcome> {
        self.handle_prepare(ns, round, proposer)
    }

    async fn accept(&self, ns: LogNamespace, proposal: Proposal) -> Result<AcceptOutcome> {
        self.handle_accept(ns, &proposal)
    }

    async fn confirm_lease(&self, term: Term, duration: Duration) -> Result<bool> {
        self.handle_confirm_lease(term, duration)
    }

    async fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>> {
        self.handle_highest_accepted(ns)
    }
}
