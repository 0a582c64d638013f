//! Quorum fan-out for the two-phase round protocol.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::timeout;

use super::acceptor::AcceptorClient;
use super::types::{AcceptOutcome, LogNamespace, NodeId, PrepareOutcome, Promise, Proposal, Reject, Round, Term};
use crate::error::{Result, TimelockError};

/// Result of driving one round to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// The value this proposer chose for the round was accepted by a quorum.
    Chosen(Proposal),
    /// A value already accepted by an acceptor was re-proposed verbatim and
    /// accepted by a quorum. It is not this proposer's value.
    Adopted(Proposal),
    /// The round was lost; retry above `highest_round_seen`.
    Lost {
        highest_round_seen: Round,
        lease: Option<Term>,
    },
}

/// Drives prepare/accept rounds against a fixed acceptor set.
///
/// The proposer is stateless between rounds; callers track which round to try
/// next from the outcomes.
pub struct Proposer {
    id: NodeId,
    acceptors: Vec<Arc<dyn AcceptorClient>>,
    rpc_timeout: Duration,
}

/// Rejections and failures collected while waiting for a quorum.
#[derive(Default)]
struct Tally {
    highest_round_seen: Round,
    lease: Option<Term>,
    rejected: usize,
    failures: Vec<String>,
}

impl Tally {
    fn reject(&mut self, reject: Reject) {
        self.rejected += 1;
        match reject {
            Reject::Superseded { promised } => {
                self.highest_round_seen = self.highest_round_seen.max(promised);
            }
            Reject::Conflict { accepted } => {
                self.highest_round_seen = self.highest_round_seen.max(accepted.round);
            }
            Reject::LeaseHeld { term } => {
                self.highest_round_seen = self.highest_round_seen.max(term.number);
                if self.lease.map_or(true, |t| t.number < term.number) {
                    self.lease = Some(term);
                }
            }
        }
    }

    fn fail(&mut self, acceptor: NodeId, error: impl std::fmt::Display) {
        self.failures.push(format!("acceptor {}: {}", acceptor, error));
    }

    /// Outcome when no quorum was reached.
    fn into_outcome(self, what: &str, ns: LogNamespace, round: Round) -> Result<RoundOutcome> {
        if self.rejected > 0 {
            return Ok(RoundOutcome::Lost {
                highest_round_seen: self.highest_round_seen.max(round),
                lease: self.lease,
            });
        }
        Err(TimelockError::ServiceUnavailable(format!(
            "no quorum for {} of {} round {}: {}",
            what,
            ns.as_str(),
            round,
            self.failures.join("; ")
        )))
    }
}

impl Proposer {
    pub fn new(id: NodeId, acceptors: Vec<Arc<dyn AcceptorClient>>, rpc_timeout: Duration) -> Self {
        Self {
            id,
            acceptors,
            rpc_timeout,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn cluster_size(&self) -> usize {
        self.acceptors.len()
    }

    /// Majority of the acceptor set.
    pub fn quorum(&self) -> usize {
        self.acceptors.len() / 2 + 1
    }

    /// Run both phases of `round` in `ns`.
    ///
    /// `choose` computes this proposer's value from the quorum's promises. It
    /// is not called when some promise reports a value already accepted at
    /// `round`; that value is re-proposed verbatim instead.
    pub async fn run_round<F>(&self, ns: LogNamespace, round: Round, choose: F) -> Result<RoundOutcome>
    where
        F: FnOnce(&[Promise]) -> Result<Vec<u8>>,
    {
        let promises = match self.prepare(ns, round).await? {
            Ok(promises) => promises,
            Err(lost) => return Ok(lost),
        };

        let (proposal, ours) = match promises.iter().find_map(|p| p.accepted.clone()) {
            Some(existing) => (existing, false),
            None => (Proposal::new(round, self.id, choose(&promises)?), true),
        };

        if let Err(lost) = self.accept(ns, &proposal).await? {
            return Ok(lost);
        }
        Ok(if ours {
            RoundOutcome::Chosen(proposal)
        } else {
            RoundOutcome::Adopted(proposal)
        })
    }

    /// Phase one. `Ok(Err(_))` means the round was lost.
    async fn prepare(
        &self,
        ns: LogNamespace,
        round: Round,
    ) -> Result<std::result::Result<Vec<Promise>, RoundOutcome>> {
        let mut pending: FuturesUnordered<_> = self
            .acceptors
            .iter()
            .map(|acceptor| {
                let acceptor = Arc::clone(acceptor);
                async move {
                    let id = acceptor.node_id();
                    (id, timeout(self.rpc_timeout, acceptor.prepare(ns, round, self.id)).await)
                }
            })
            .collect();

        let quorum = self.quorum();
        let mut promises = Vec::new();
        let mut tally = Tally::default();

        while let Some((id, response)) = pending.next().await {
            match response {
                Ok(Ok(PrepareOutcome::Promised(promise))) => promises.push(promise),
                Ok(Ok(PrepareOutcome::Rejected(reject))) => tally.reject(reject),
                Ok(Err(e)) => tally.fail(id, e),
                Err(_) => tally.fail(id, "prepare timed out"),
            }
            if promises.len() >= quorum || promises.len() + pending.len() < quorum {
                break;
            }
        }

        if promises.len() >= quorum {
            return Ok(Ok(promises));
        }
        tracing::debug!(
            "proposer {} lost prepare of {} round {} ({} promises)",
            self.id,
            ns.as_str(),
            round,
            promises.len()
        );
        tally.into_outcome("prepare", ns, round).map(Err)
    }

    /// Phase two. `Ok(Err(_))` means the round was lost.
    async fn accept(
        &self,
        ns: LogNamespace,
        proposal: &Proposal,
    ) -> Result<std::result::Result<(), RoundOutcome>> {
        let mut pending: FuturesUnordered<_> = self
            .acceptors
            .iter()
            .map(|acceptor| {
                let acceptor = Arc::clone(acceptor);
                let proposal = proposal.clone();
                async move {
                    let id = acceptor.node_id();
                    (id, timeout(self.rpc_timeout, acceptor.accept(ns, proposal)).await)
                }
            })
            .collect();

        let quorum = self.quorum();
        let mut acks = 0;
        let mut tally = Tally::default();

        while let Some((id, response)) = pending.next().await {
            match response {
                Ok(Ok(AcceptOutcome::Accepted)) => acks += 1,
                Ok(Ok(AcceptOutcome::Rejected(reject))) => tally.reject(reject),
                Ok(Err(e)) => tally.fail(id, e),
                Err(_) => tally.fail(id, "accept timed out"),
            }
            if acks >= quorum || acks + pending.len() < quorum {
                break;
            }
        }

        if acks >= quorum {
            return Ok(Ok(()));
        }
        tracing::debug!(
            "proposer {} lost accept of {} round {} ({} acks)",
            self.id,
            ns.as_str(),
            proposal.round,
            acks
        );
        tally.into_outcome("accept", ns, proposal.round).map(Err)
    }

    /// Ask every acceptor to back `term`; returns how many agreed, stopping
    /// early once a quorum has.
    pub async fn confirm_lease(&self, term: Term, duration: Duration) -> usize {
        let mut pending: FuturesUnordered<_> = self
            .acceptors
            .iter()
            .map(|acceptor| {
                let acceptor = Arc::clone(acceptor);
                async move {
                    let id = acceptor.node_id();
                    (id, timeout(self.rpc_timeout, acceptor.confirm_lease(term, duration)).await)
                }
            })
            .collect();

        let quorum = self.quorum();
        let mut confirmed = 0;
        while let Some((id, response)) = pending.next().await {
            match response {
                Ok(Ok(true)) => confirmed += 1,
                Ok(Ok(false)) => tracing::debug!("acceptor {} declined lease for term {}", id, term),
                Ok(Err(e)) => tracing::debug!("acceptor {} lease confirmation failed: {}", id, e),
                Err(_) => tracing::debug!("acceptor {} lease confirmation timed out", id),
            }
            if confirmed >= quorum {
                break;
            }
        }
        confirmed
    }

    /// Highest accepted proposal in `ns` among the acceptors that answer.
    pub async fn discover(&self, ns: LogNamespace) -> Option<Proposal> {
        let responses = futures::future::join_all(self.acceptors.iter().map(|acceptor| {
            let acceptor = Arc::clone(acceptor);
            async move { timeout(self.rpc_timeout, acceptor.highest_accepted(ns)).await }
        }))
        .await;

        responses
            .into_iter()
            .filter_map(|r| r.ok().and_then(|r| r.ok()).flatten())
            .max_by_key(|p| p.round)
    }
}
