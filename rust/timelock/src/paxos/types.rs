//! Wire-level types shared by proposers and acceptors.

use serde::{Deserialize, Serialize};

/// Cluster member identifier.
pub type NodeId = u64;

/// Paxos round number. In the leadership log this is the term number.
pub type Round = u64;

/// A leadership term: at most one leader ever exists per term number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub number: u64,
    pub leader_id: NodeId,
}

impl std::fmt::Display for Term {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.number, self.leader_id)
    }
}

/// Independent logs kept by every acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogNamespace {
    /// Round `R` decides the leader of term `R`.
    Leadership,
    /// Round `R` decides the `R`-th upper bound on issued timestamps.
    TimestampBound,
}

impl LogNamespace {
    pub const ALL: [LogNamespace; 2] = [LogNamespace::Leadership, LogNamespace::TimestampBound];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogNamespace::Leadership => "leadership",
            LogNamespace::TimestampBound => "timestamp_bound",
        }
    }
}

/// A proposed value for one round of one log.
///
/// Once a quorum has accepted it, it is never replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub round: Round,
    pub proposer_id: NodeId,
    pub value: Vec<u8>,
}

impl Proposal {
    pub fn new(round: Round, proposer_id: NodeId, value: Vec<u8>) -> Self {
        Self {
            round,
            proposer_id,
            value,
        }
    }

    /// Decode the value with bincode.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(bincode::deserialize(&self.value)?)
    }
}

/// Answer to a successful `prepare`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promise {
    /// Value this acceptor already accepted for the prepared round.
    pub accepted: Option<Proposal>,
    /// Highest-round value this acceptor accepted below the prepared round.
    pub highest_accepted_below: Option<Proposal>,
}

/// Why an acceptor refused a `prepare` or `accept`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reject {
    /// The acceptor already participated in a higher round.
    Superseded { promised: Round },
    /// A different value was already accepted for this round.
    Conflict { accepted: Proposal },
    /// A live leader lease covers this acceptor. Also serves as a redirect.
    LeaseHeld { term: Term },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareOutcome {
    Promised(Promise),
    Rejected(Reject),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AcceptOutcome {
    Accepted,
    Rejected(Reject),
}

/// Value stored in a leadership-log proposal.
pub fn encode_term(term: &Term) -> crate::Result<Vec<u8>> {
    Ok(bincode::serialize(term)?)
}
