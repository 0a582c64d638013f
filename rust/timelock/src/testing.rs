//! Test doubles shared by unit tests.

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{Result, TimelockError};
use crate::paxos::{Leadership, LeadershipStatus, NodeId, Term};

/// Leadership whose term the test moves by hand.
pub(crate) struct SwitchableLeader {
    term: Mutex<Option<Term>>,
    status: watch::Sender<LeadershipStatus>,
}

impl SwitchableLeader {
    pub(crate) fn new(number: u64) -> std::sync::Arc<Self> {
        let term = Term {
            number,
            leader_id: 1,
        };
        let (status, _) = watch::channel(LeadershipStatus {
            term: Some(term),
            is_leader: true,
        });
        std::sync::Arc::new(Self {
            term: Mutex::new(Some(term)),
            status,
        })
    }

    /// Lead `term`, or follow node 2 when `None`.
    pub(crate) fn set(&self, term: Option<Term>) {
        *self.term.lock() = term;
        self.status.send_replace(LeadershipStatus {
            term: term.or(Some(Term {
                number: u64::MAX,
                leader_id: 2,
            })),
            is_leader: term.is_some(),
        });
    }

    pub(crate) fn advance(&self) -> Term {
        let next = Term {
            number: self.current_term().map_or(1, |t| t.number + 1),
            leader_id: 1,
        };
        self.set(Some(next));
        next
    }
}

impl Leadership for SwitchableLeader {
    fn node_id(&self) -> NodeId {
        1
    }

    fn current_term(&self) -> Option<Term> {
        *self.term.lock()
    }

    fn ensure_leader(&self) -> Result<Term> {
        (*self.term.lock()).ok_or(TimelockError::NotCurrentLeader {
            leader_hint: Some(2),
        })
    }

    fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status.subscribe()
    }
}
