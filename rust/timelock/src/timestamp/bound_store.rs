//! Durable upper bound on issued timestamps.
//!
//! A leader only hands out timestamps from a batch `[lower, upper)` whose
//! `upper` has been durably recorded first. Every reservation starts at or
//! above every bound recorded before it, so a crashed leader's unused
//! remainder is skipped rather than reissued.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::allocator::TimestampBatch;
use crate::error::{Result, TimelockError};
use crate::paxos::{LogNamespace, Proposer, Round, RoundOutcome};
use crate::storage::{RedbStore, RedbTree};

/// First timestamp ever issued by a fresh cluster.
pub const INITIAL_TIMESTAMP: u64 = 1;

/// Tree and key of the bound cell in external-KV mode.
pub const BOUND_TREE: &str = "timestamp_bound";
pub const BOUND_KEY: &[u8] = b"upper_bound";

#[async_trait]
pub trait TimestampBoundStore: Send + Sync {
    /// Durably reserve `size` timestamps above every earlier reservation.
    async fn reserve(&self, size: u64) -> Result<TimestampBatch>;
}

fn extend(lower: u64, size: u64) -> Result<TimestampBatch> {
    let upper = lower
        .checked_add(size)
        .ok_or_else(|| TimelockError::ServiceUnavailable("timestamp space exhausted".into()))?;
    Ok(TimestampBatch { lower, upper })
}

/// Bound store agreed through the `TimestampBound` log.
///
/// Round `R` of the log holds the `R`-th bound. To reserve, a proposer
/// prepares the next round, takes the largest bound reported below it by the
/// promising quorum, and proposes that plus `size`. Any bound chosen earlier
/// was accepted by a quorum intersecting this one, so the new batch lies
/// above it.
pub struct PaxosBoundStore {
    proposer: Arc<Proposer>,
    next_round: Mutex<Round>,
    max_round_attempts: u32,
}

impl PaxosBoundStore {
    pub fn new(proposer: Arc<Proposer>, max_round_attempts: u32) -> Self {
        Self {
            proposer,
            next_round: Mutex::new(1),
            max_round_attempts: max_round_attempts.max(1),
        }
    }

    fn highest_bound(promises: &[crate::paxos::Promise]) -> Result<u64> {
        let mut highest = INITIAL_TIMESTAMP;
        for promise in promises {
            if let Some(prior) = &promise.highest_accepted_below {
                highest = highest.max(prior.decode::<u64>()?);
            }
        }
        Ok(highest)
    }
}

#[async_trait]
impl TimestampBoundStore for PaxosBoundStore {
    async fn reserve(&self, size: u64) -> Result<TimestampBatch> {
        for _ in 0..self.max_round_attempts {
            let round = *self.next_round.lock();
            let mut reserved = None;

            let outcome = self
                .proposer
                .run_round(LogNamespace::TimestampBound, round, |promises| {
                    let batch = extend(Self::highest_bound(promises)?, size)?;
                    reserved = Some(batch);
                    Ok(bincode::serialize(&batch.upper)?)
                })
                .await?;

            let next = match &outcome {
                RoundOutcome::Lost {
                    highest_round_seen, ..
                } => highest_round_seen + 1,
                _ => round + 1,
            };
            {
                let mut next_round = self.next_round.lock();
                *next_round = (*next_round).max(next);
            }

            match (outcome, reserved) {
                (RoundOutcome::Chosen(_), Some(batch)) => {
                    tracing::debug!(
                        round,
                        lower = batch.lower,
                        upper = batch.upper,
                        "reserved timestamp batch"
                    );
                    return Ok(batch);
                }
                (outcome, _) => {
                    tracing::debug!(round, "timestamp bound round not won: {:?}", outcome);
                }
            }
        }
        Err(TimelockError::ServiceUnavailable(format!(
            "timestamp bound not reserved after {} rounds",
            self.max_round_attempts
        )))
    }
}

/// Bound store kept in a single compare-and-swap cell of an embedded KV
/// table. Used by single-node deployments.
pub struct KvBoundStore {
    tree: RedbTree,
}

impl KvBoundStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_store(&RedbStore::open(path)?)
    }

    pub fn with_store(store: &RedbStore) -> Result<Self> {
        Ok(Self {
            tree: store.tree(BOUND_TREE)?,
        })
    }

    /// Current persisted upper bound.
    pub fn current_bound(&self) -> Result<u64> {
        Ok(self
            .tree
            .get_bincode::<u64>(BOUND_KEY)?
            .unwrap_or(INITIAL_TIMESTAMP))
    }
}

#[async_trait]
impl TimestampBoundStore for KvBoundStore {
    async fn reserve(&self, size: u64) -> Result<TimestampBatch> {
        loop {
            let current = self.tree.get(BOUND_KEY)?;
            let lower = match &current {
                Some(bytes) => bincode::deserialize::<u64>(bytes)?,
                None => INITIAL_TIMESTAMP,
            };
            let batch = extend(lower, size)?;
            let new = bincode::serialize(&batch.upper)?;

            match self
                .tree
                .compare_and_swap(BOUND_KEY, current.as_deref(), Some(&new))?
            {
                Ok(()) => return Ok(batch),
                Err(_) => tracing::debug!("timestamp bound moved concurrently, retrying"),
            }
        }
    }
}

/// A bound store installed once its backing store becomes reachable.
#[derive(Default)]
pub struct DeferredBoundStore {
    inner: OnceLock<Arc<dyn TimestampBoundStore>>,
}

impl DeferredBoundStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the backing store. Returns `false` if one was already installed.
    pub fn install(&self, store: Arc<dyn TimestampBoundStore>) -> bool {
        self.inner.set(store).is_ok()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.get().is_some()
    }
}

#[async_trait]
impl TimestampBoundStore for DeferredBoundStore {
    async fn reserve(&self, size: u64) -> Result<TimestampBatch> {
        match self.inner.get() {
            Some(store) => store.reserve(size).await,
            None => Err(TimelockError::NotInitialized {
                reason: "timestamp bound store not installed".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::{Acceptor, AcceptorClient, InMemoryProposalLog};
    use std::time::Duration;

    fn proposer(id: u64, acceptors: &[Arc<dyn AcceptorClient>]) -> Arc<Proposer> {
        Arc::new(Proposer::new(id, acceptors.to_vec(), Duration::from_millis(100)))
    }

    fn acceptors(n: u64) -> Vec<Arc<dyn AcceptorClient>> {
        (1..=n)
            .map(|id| {
                Arc::new(Acceptor::new(id, Arc::new(InMemoryProposalLog::new())))
                    as Arc<dyn AcceptorClient>
            })
            .collect()
    }

    #[tokio::test]
    async fn test_paxos_batches_are_disjoint_and_increasing() {
        let acc = acceptors(3);
        let store = PaxosBoundStore::new(proposer(1, &acc), 5);

        let first = store.reserve(100).await.unwrap();
        assert_eq!(first, TimestampBatch { lower: 1, upper: 101 });
        let second = store.reserve(10).await.unwrap();
        assert_eq!(second, TimestampBatch { lower: 101, upper: 111 });
    }

    #[tokio::test]
    async fn test_paxos_new_proposer_starts_above_old_bound() {
        let acc = acceptors(3);
        let old = PaxosBoundStore::new(proposer(1, &acc), 5);
        let batch = old.reserve(100).await.unwrap();

        // A fresh proposer starts at round 1 and has to climb past the old
        // rounds, but its batch still begins at the old upper bound.
        let new = PaxosBoundStore::new(proposer(2, &acc), 5);
        let next = new.reserve(100).await.unwrap();
        assert!(next.lower >= batch.upper);
    }

    #[tokio::test]
    async fn test_paxos_overflow_is_rejected() {
        let acc = acceptors(1);
        let store = PaxosBoundStore::new(proposer(1, &acc), 2);
        store.reserve(u64::MAX - 10).await.unwrap();
        assert!(store.reserve(100).await.is_err());
    }

    #[tokio::test]
    async fn test_kv_bound_store() {
        let store = KvBoundStore::with_store(&RedbStore::open_temporary().unwrap()).unwrap();
        assert_eq!(store.current_bound().unwrap(), INITIAL_TIMESTAMP);

        let a = store.reserve(50).await.unwrap();
        let b = store.reserve(50).await.unwrap();
        assert_eq!(a, TimestampBatch { lower: 1, upper: 51 });
        assert_eq!(b.lower, a.upper);
        assert_eq!(store.current_bound().unwrap(), 101);
    }

    #[tokio::test]
    async fn test_deferred_bound_store() {
        let deferred = DeferredBoundStore::new();
        assert!(matches!(
            deferred.reserve(10).await,
            Err(TimelockError::NotInitialized { .. })
        ));
        let kv = KvBoundStore::with_store(&RedbStore::open_temporary().unwrap()).unwrap();
        assert!(deferred.install(Arc::new(kv)));
        assert!(deferred.is_installed());
        assert_eq!(deferred.reserve(10).await.unwrap().lower, INITIAL_TIMESTAMP);
    }

    #[tokio::test]
    async fn test_kv_bound_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kvs.redb");
        {
            let store = KvBoundStore::open(&path).unwrap();
            store.reserve(1000).await.unwrap();
        }
        let store = KvBoundStore::open(&path).unwrap();
        assert_eq!(store.reserve(1).await.unwrap().lower, 1001);
    }
}
