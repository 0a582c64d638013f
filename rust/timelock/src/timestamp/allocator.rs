//! Leader-local timestamp allocation from durably reserved batches.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::bound_store::TimestampBoundStore;
use crate::error::{Result, TimelockError};
use crate::gate::AvailabilityGate;
use crate::paxos::{Leadership, Term};

/// A reserved half-open range `[lower, upper)` owned by one leader term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampBatch {
    pub lower: u64,
    pub upper: u64,
}

impl TimestampBatch {
    pub fn len(&self) -> u64 {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }
}

/// A contiguous range of fresh timestamps `[lower, upper)` handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampRange {
    pub lower: u64,
    pub upper: u64,
}

impl TimestampRange {
    pub fn len(&self) -> u64 {
        self.upper - self.lower
    }

    pub fn is_empty(&self) -> bool {
        self.lower >= self.upper
    }
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    /// Timestamps reserved per refill.
    pub batch_size: u64,
    /// Longest a caller waits for a refill before `ServiceUnavailable`.
    pub reservation_timeout: Duration,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            reservation_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct AllocatorState {
    /// Term the current batch belongs to.
    term: Option<Term>,
    next: u64,
    upper: u64,
}

impl AllocatorState {
    /// Take `count` values if the batch belongs to `term` and has room.
    /// A batch from another term is discarded.
    fn take(&mut self, term: Term, count: u64) -> Option<TimestampRange> {
        if self.term != Some(term) {
            if self.term.is_some() {
                tracing::info!(
                    "discarding timestamp batch remainder [{}, {}) from term {:?}",
                    self.next,
                    self.upper,
                    self.term.map(|t| t.number)
                );
            }
            *self = AllocatorState {
                term: Some(term),
                next: 0,
                upper: 0,
            };
            return None;
        }
        if self.upper.saturating_sub(self.next) < count {
            return None;
        }
        let lower = self.next;
        self.next += count;
        Some(TimestampRange {
            lower,
            upper: self.next,
        })
    }
}

/// Issues strictly increasing timestamps while this node leads.
pub struct TimestampService {
    leadership: Arc<dyn Leadership>,
    gate: Arc<AvailabilityGate>,
    store: Arc<dyn TimestampBoundStore>,
    config: AllocatorConfig,
    state: Mutex<AllocatorState>,
    /// Serializes refills so only one reservation is in flight.
    refill: tokio::sync::Mutex<()>,
}

impl TimestampService {
    pub fn new(
        leadership: Arc<dyn Leadership>,
        gate: Arc<AvailabilityGate>,
        store: Arc<dyn TimestampBoundStore>,
        config: AllocatorConfig,
    ) -> Self {
        Self {
            leadership,
            gate,
            store,
            config,
            state: Mutex::new(AllocatorState::default()),
            refill: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get_fresh_timestamp(&self) -> Result<u64> {
        Ok(self.get_fresh_timestamps(1).await?.lower)
    }

    /// A contiguous range of `count` fresh timestamps.
    pub async fn get_fresh_timestamps(&self, count: u32) -> Result<TimestampRange> {
        if count == 0 {
            return Err(TimelockError::InvalidArgument(
                "timestamp count must be positive".into(),
            ));
        }
        self.gate.check()?;
        let term = self.leadership.ensure_leader()?;
        let count = u64::from(count);

        if let Some(range) = self.state.lock().take(term, count) {
            return Ok(range);
        }

        let deadline = Instant::now() + self.config.reservation_timeout;
        loop {
            let _refill = tokio::time::timeout_at(deadline, self.refill.lock())
                .await
                .map_err(|_| {
                    TimelockError::ServiceUnavailable("timed out waiting for timestamp reservation".into())
                })?;

            // Another caller may have refilled while we waited.
            if let Some(range) = self.state.lock().take(term, count) {
                return Ok(range);
            }

            let size = self.config.batch_size.max(count);
            let batch = tokio::time::timeout_at(deadline, self.store.reserve(size))
                .await
                .map_err(|_| {
                    TimelockError::ServiceUnavailable(format!(
                        "timestamp reservation exceeded {:?}",
                        self.config.reservation_timeout
                    ))
                })??;

            match self.leadership.ensure_leader() {
                Ok(current) if current == term => {}
                _ => {
                    tracing::warn!(
                        "term {} ended during timestamp reservation, dropping [{}, {})",
                        term.number,
                        batch.lower,
                        batch.upper
                    );
                    return Err(TimelockError::LeaderLost { term: term.number });
                }
            }

            let mut state = self.state.lock();
            if state.term != Some(term) {
                return Err(TimelockError::LeaderLost { term: term.number });
            }
            tracing::debug!(
                term = term.number,
                lower = batch.lower,
                upper = batch.upper,
                "installed timestamp batch"
            );
            state.next = batch.lower;
            state.upper = batch.upper;
            if let Some(range) = state.take(term, count) {
                return Ok(range);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::SoleLeader;
    use crate::storage::RedbStore;
    use crate::testing::SwitchableLeader;
    use crate::timestamp::KvBoundStore;
    use async_trait::async_trait;
    use std::collections::HashSet;

    /// Bound store that never answers.
    struct StuckStore;

    #[async_trait]
    impl TimestampBoundStore for StuckStore {
        async fn reserve(&self, _size: u64) -> Result<TimestampBatch> {
            std::future::pending().await
        }
    }

    fn kv_store() -> Arc<dyn TimestampBoundStore> {
        Arc::new(KvBoundStore::with_store(&RedbStore::open_temporary().unwrap()).unwrap())
    }

    fn service(
        leadership: Arc<dyn Leadership>,
        store: Arc<dyn TimestampBoundStore>,
        batch_size: u64,
    ) -> TimestampService {
        TimestampService::new(
            leadership,
            Arc::new(AvailabilityGate::ready()),
            store,
            AllocatorConfig {
                batch_size,
                reservation_timeout: Duration::from_millis(200),
            },
        )
    }

    #[tokio::test]
    async fn test_timestamps_strictly_increase_across_refills() {
        let svc = service(Arc::new(SoleLeader::new(1)), kv_store(), 10);
        let mut last = 0;
        for _ in 0..35 {
            let ts = svc.get_fresh_timestamp().await.unwrap();
            assert!(ts > last);
            last = ts;
        }
    }

    #[tokio::test]
    async fn test_range_larger_than_batch() {
        let svc = service(Arc::new(SoleLeader::new(1)), kv_store(), 10);
        let first = svc.get_fresh_timestamp().await.unwrap();
        let range = svc.get_fresh_timestamps(25).await.unwrap();
        assert_eq!(range.len(), 25);
        assert!(range.lower > first);
        assert!(svc.get_fresh_timestamp().await.unwrap() >= range.upper);
    }

    #[tokio::test]
    async fn test_zero_count_is_invalid() {
        let svc = service(Arc::new(SoleLeader::new(1)), kv_store(), 10);
        assert!(matches!(
            svc.get_fresh_timestamps(0).await,
            Err(TimelockError::InvalidArgument(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_unique_values() {
        let svc = Arc::new(service(Arc::new(SoleLeader::new(1)), kv_store(), 7));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let svc = Arc::clone(&svc);
            handles.push(tokio::spawn(async move {
                let mut values = Vec::new();
                for _ in 0..50 {
                    values.push(svc.get_fresh_timestamp().await.unwrap());
                }
                values
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            let values = handle.await.unwrap();
            assert!(values.windows(2).all(|w| w[0] < w[1]));
            for v in values {
                assert!(seen.insert(v), "duplicate timestamp {}", v);
            }
        }
        assert_eq!(seen.len(), 400);
    }

    #[tokio::test]
    async fn test_not_leader_is_redirected() {
        let leader = SwitchableLeader::new(1);
        leader.set(None);
        let svc = service(leader, kv_store(), 10);
        let err = svc.get_fresh_timestamp().await.unwrap_err();
        assert_eq!(err.leader_hint(), Some(2));
    }

    #[tokio::test]
    async fn test_not_initialized_before_gate_opens() {
        let svc = TimestampService::new(
            Arc::new(SoleLeader::new(1)),
            Arc::new(AvailabilityGate::new()),
            kv_store(),
            AllocatorConfig::default(),
        );
        assert!(matches!(
            svc.get_fresh_timestamp().await,
            Err(TimelockError::NotInitialized { .. })
        ));
    }

    #[tokio::test]
    async fn test_term_change_discards_batch() {
        let leader = SwitchableLeader::new(1);
        let store = kv_store();
        let svc = service(leader.clone(), store, 100);

        let a = svc.get_fresh_timestamp().await.unwrap();
        leader.set(Some(Term {
            number: 2,
            leader_id: 1,
        }));
        let b = svc.get_fresh_timestamp().await.unwrap();
        // The new term starts a fresh reservation above the old batch.
        assert!(b >= a + 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_reservation_times_out() {
        let svc = service(Arc::new(SoleLeader::new(1)), Arc::new(StuckStore), 10);
        let err = svc.get_fresh_timestamp().await.unwrap_err();
        assert!(matches!(err, TimelockError::ServiceUnavailable(_)));
    }
}
