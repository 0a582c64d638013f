//! Leader election and lease renewal over the leadership log.
//!
//! Round `R` of the leadership log decides the leader of term `R`. A node that
//! wins a round is leader only once a quorum of acceptors has confirmed its
//! lease, and only until `renewal_started_at + lease_duration`. Acceptors
//! refuse challengers while a lease is live, and the leader's own deadline
//! is measured from before it asked, so it always steps down first.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;

use super::proposer::{Proposer, RoundOutcome};
use super::types::{encode_term, LogNamespace, NodeId, Round, Term};
use crate::error::{Result, TimelockError};

/// Timing knobs for election and lease renewal.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a confirmed lease lasts, measured from the renewal start.
    pub lease_duration: Duration,
    /// How often the leader renews. Must be well below `lease_duration`.
    pub renew_interval: Duration,
    /// How often a follower tries to take over. Jitter of up to the same
    /// amount is added.
    pub campaign_interval: Duration,
    /// Round collisions tolerated per campaign before giving up.
    pub max_round_attempts: u32,
    /// Base delay between colliding rounds (jittered).
    pub round_backoff: Duration,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_millis(2_000),
            renew_interval: Duration::from_millis(500),
            campaign_interval: Duration::from_millis(1_000),
            max_round_attempts: 5,
            round_backoff: Duration::from_millis(20),
        }
    }
}

/// What a node currently believes about leadership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadershipStatus {
    /// Highest term this node knows of.
    pub term: Option<Term>,
    /// Whether this node leads `term` under a live lease.
    pub is_leader: bool,
}

/// "Which term do I lead right now", as consumed by the allocator and the
/// lock manager.
pub trait Leadership: Send + Sync {
    fn node_id(&self) -> NodeId;

    /// Highest term known to this node.
    fn current_term(&self) -> Option<Term>;

    /// The term this node leads, or `NotCurrentLeader` with a redirect hint.
    fn ensure_leader(&self) -> Result<Term>;

    /// Status changes, including step-downs.
    fn subscribe(&self) -> watch::Receiver<LeadershipStatus>;
}

#[derive(Debug, Default)]
struct ElectorState {
    known_term: Option<Term>,
    /// Set only while this node leads `known_term`.
    lease_until: Option<Instant>,
    highest_round_seen: Round,
}

impl ElectorState {
    fn status(&self, now: Instant) -> LeadershipStatus {
        LeadershipStatus {
            term: self.known_term,
            is_leader: self.lease_until.map_or(false, |until| now < until),
        }
    }
}

/// Campaigns for and holds leadership of the leadership log.
pub struct LeaderElector {
    id: NodeId,
    proposer: Arc<Proposer>,
    config: ElectionConfig,
    state: Mutex<ElectorState>,
    status: watch::Sender<LeadershipStatus>,
}

impl LeaderElector {
    pub fn new(proposer: Arc<Proposer>, config: ElectionConfig) -> Self {
        let (status, _) = watch::channel(LeadershipStatus::default());
        Self {
            id: proposer.id(),
            proposer,
            config,
            state: Mutex::new(ElectorState::default()),
            status,
        }
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Whether this node holds an unexpired lease.
    pub fn holds_lease(&self) -> bool {
        self.state.lock().status(Instant::now()).is_leader
    }

    fn publish(&self, state: &ElectorState) {
        let next = state.status(Instant::now());
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    /// Record a term learned from a peer. Steps down if it supersedes ours.
    fn observe_term(&self, term: Term) {
        let mut state = self.state.lock();
        state.highest_round_seen = state.highest_round_seen.max(term.number);
        if state.known_term.map_or(true, |t| t.number < term.number) {
            if state.lease_until.take().is_some() {
                tracing::info!("node {} stepping down: term {} observed", self.id, term);
            }
            state.known_term = Some(term);
        }
        self.publish(&state);
    }

    fn observe_round(&self, round: Round) {
        let mut state = self.state.lock();
        state.highest_round_seen = state.highest_round_seen.max(round);
    }

    fn step_down(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.lease_until.take().is_some() {
            tracing::warn!(
                "node {} stepping down from term {:?}: {}",
                self.id,
                state.known_term.map(|t| t.number),
                reason
            );
        }
        self.publish(&state);
    }

    fn next_round(&self) -> Round {
        let state = self.state.lock();
        state
            .highest_round_seen
            .max(state.known_term.map_or(0, |t| t.number))
            + 1
    }

    fn jitter(max: Duration) -> Duration {
        let millis = max.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }

    /// Seed the known term from the acceptors so redirect hints and the first
    /// campaign round start from the cluster's actual state.
    pub async fn discover(&self) {
        if let Some(proposal) = self.proposer.discover(LogNamespace::Leadership).await {
            match proposal.decode::<Term>() {
                Ok(term) => self.observe_term(term),
                Err(e) => tracing::warn!("undecodable leadership proposal: {}", e),
            }
        }
    }

    /// Try to become leader of a fresh term.
    ///
    /// Returns the won term once its lease is confirmed. A live lease held by
    /// another node surfaces as `NotCurrentLeader` naming that node.
    pub async fn campaign(&self) -> Result<Term> {
        for attempt in 0..self.config.max_round_attempts {
            let round = self.next_round();
            let value = encode_term(&Term {
                number: round,
                leader_id: self.id,
            })?;

            match self
                .proposer
                .run_round(LogNamespace::Leadership, round, move |_| Ok(value))
                .await?
            {
                RoundOutcome::Chosen(proposal) => {
                    let term: Term = proposal.decode()?;
                    self.observe_term(term);
                    return self.establish(term).await;
                }
                RoundOutcome::Adopted(proposal) => {
                    let term: Term = proposal.decode()?;
                    self.observe_term(term);
                    if term.leader_id == self.id {
                        return self.establish(term).await;
                    }
                    // Someone else owns this term. If its lease is live the
                    // next round is refused with a redirect.
                    tracing::debug!(
                        "node {} learned leader {} for round {}",
                        self.id,
                        term.leader_id,
                        round
                    );
                }
                RoundOutcome::Lost {
                    highest_round_seen,
                    lease,
                } => {
                    self.observe_round(highest_round_seen);
                    if let Some(term) = lease {
                        self.observe_term(term);
                        return Err(TimelockError::NotCurrentLeader {
                            leader_hint: Some(term.leader_id),
                        });
                    }
                    tracing::debug!(
                        "node {} lost leadership round {} (attempt {}), highest seen {}",
                        self.id,
                        round,
                        attempt + 1,
                        highest_round_seen
                    );
                    let backoff = self.config.round_backoff + Self::jitter(self.config.round_backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        if let Some(term) = self.current_term().filter(|t| t.leader_id != self.id) {
            return Err(TimelockError::NotCurrentLeader {
                leader_hint: Some(term.leader_id),
            });
        }
        Err(TimelockError::ServiceUnavailable(format!(
            "leader election did not converge after {} rounds",
            self.config.max_round_attempts
        )))
    }

    /// Obtain the first lease for a term this node just won.
    async fn establish(&self, term: Term) -> Result<Term> {
        if self.confirm(term).await {
            tracing::info!("node {} is leader for term {}", self.id, term.number);
            Ok(term)
        } else {
            Err(TimelockError::ServiceUnavailable(format!(
                "won term {} but could not confirm a lease",
                term.number
            )))
        }
    }

    async fn confirm(&self, term: Term) -> bool {
        let started = Instant::now();
        let confirmed = self
            .proposer
            .confirm_lease(term, self.config.lease_duration)
            .await;
        if confirmed < self.proposer.quorum() {
            return false;
        }

        let mut state = self.state.lock();
        if state.known_term != Some(term) {
            return false;
        }
        let until = started + self.config.lease_duration;
        state.lease_until = Some(state.lease_until.map_or(until, |u| u.max(until)));
        self.publish(&state);
        true
    }

    /// Renew the lease of the term this node leads.
    pub async fn renew(&self) -> Result<()> {
        let term = self.ensure_leader()?;
        if self.confirm(term).await {
            return Ok(());
        }
        tracing::warn!("node {} failed to renew lease for term {}", self.id, term.number);
        if !self.holds_lease() {
            self.step_down("lease expired without renewal");
        }
        Err(TimelockError::ServiceUnavailable(format!(
            "lease renewal for term {} did not reach a quorum",
            term.number
        )))
    }

    /// Background loop: renew as leader, campaign as follower, until
    /// `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        self.discover().await;
        let mut delay = Self::jitter(self.config.campaign_interval);

        loop {
            let stopped = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                changed = shutdown.changed() => changed.is_err(),
            };
            if stopped || *shutdown.borrow() {
                tracing::info!("leader elector on node {} shutting down", self.id);
                self.step_down("shutdown");
                break;
            }

            if self.holds_lease() {
                if let Err(e) = self.renew().await {
                    tracing::warn!("lease renewal: {}", e);
                }
            } else {
                self.step_down("lease expired");
                match self.campaign().await {
                    Ok(_) => {}
                    Err(TimelockError::NotCurrentLeader { leader_hint }) => {
                        tracing::debug!("node {} follows {:?}", self.id, leader_hint);
                    }
                    Err(e) => tracing::warn!("campaign on node {} failed: {}", self.id, e),
                }
            }

            delay = if self.holds_lease() {
                self.config.renew_interval
            } else {
                self.config.campaign_interval + Self::jitter(self.config.campaign_interval)
            };
        }
    }
}

impl Leadership for LeaderElector {
    fn node_id(&self) -> NodeId {
        self.id
    }

    fn current_term(&self) -> Option<Term> {
        self.state.lock().known_term
    }

    fn ensure_leader(&self) -> Result<Term> {
        let mut state = self.state.lock();
        let now = Instant::now();
        if let (Some(term), Some(until)) = (state.known_term, state.lease_until) {
            if now < until {
                return Ok(term);
            }
            state.lease_until = None;
            tracing::warn!("node {} lease for term {} expired", self.id, term.number);
            self.publish(&state);
        }
        Err(TimelockError::NotCurrentLeader {
            leader_hint: state
                .known_term
                .map(|t| t.leader_id)
                .filter(|&leader| leader != self.id),
        })
    }

    fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status.subscribe()
    }
}

/// Static leadership for a single-node deployment whose timestamp bound lives
/// in an external KV store. The node leads term 1 forever.
pub struct SoleLeader {
    term: Term,
    status: watch::Sender<LeadershipStatus>,
}

impl SoleLeader {
    pub fn new(node_id: NodeId) -> Self {
        let term = Term {
            number: 1,
            leader_id: node_id,
        };
        let (status, _) = watch::channel(LeadershipStatus {
            term: Some(term),
            is_leader: true,
        });
        Self { term, status }
    }
}

impl Leadership for SoleLeader {
    fn node_id(&self) -> NodeId {
        self.term.leader_id
    }

    fn current_term(&self) -> Option<Term> {
        Some(self.term)
    }

    fn ensure_leader(&self) -> Result<Term> {
        Ok(self.term)
    }

    fn subscribe(&self) -> watch::Receiver<LeadershipStatus> {
        self.status.subscribe()
    }
}
