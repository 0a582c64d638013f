//! Leader-local lock table with FIFO wait queues and term fencing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::{HolderInfo, LockEntry, LockMode, LockRequest, LockToken, Waiter};
use crate::error::{Result, TimelockError};
use crate::gate::AvailabilityGate;
use crate::paxos::{Leadership, LeadershipStatus, Term};

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Wait budget used when a caller does not pass one.
    pub default_timeout: Duration,
    /// Waiters allowed per lock name before new ones are refused.
    pub max_queue_depth: usize,
    /// Lifetime of a granted token unless refreshed.
    pub token_ttl: Duration,
    /// How often expired holders are swept.
    pub reaper_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_queue_depth: 1_000,
            token_ttl: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct LockTable {
    /// Term every holder and waiter in `locks` belongs to.
    term: Option<Term>,
    /// Highest term number the table has ever been bound to.
    highest: u64,
    locks: HashMap<String, LockEntry>,
}

impl LockTable {
    /// Bind the table to `term`. Anything from another term is dropped and
    /// its waiters fail with `LeaderLost`. Returns how many waiters failed.
    ///
    /// Terms only move forward: binding to a term older than one already
    /// seen fails with `LeaderLost` and leaves the table untouched.
    fn fence(&mut self, term: Option<Term>) -> Result<usize> {
        if self.term == term {
            return Ok(0);
        }
        if let Some(stale) = term.filter(|t| t.number < self.highest) {
            return Err(TimelockError::LeaderLost { term: stale.number });
        }
        let lost = self.term.map_or(0, |t| t.number);
        let mut failed = 0;
        for (_, entry) in self.locks.drain() {
            for waiter in entry.queue {
                let _ = waiter.grant.send(Err(TimelockError::LeaderLost { term: lost }));
                failed += 1;
            }
        }
        if let Some(t) = term {
            self.highest = self.highest.max(t.number);
        }
        self.term = term;
        Ok(failed)
    }

    /// Grant queued waiters in order for as long as the head is compatible:
    /// a run of shared waiters together, an exclusive waiter alone.
    fn grant_waiters(entry: &mut LockEntry, lock_name: &str, term: Term, ttl: Duration, now: Instant) {
        while entry
            .queue
            .front()
            .map_or(false, |w| entry.compatible(w.mode))
        {
            let Some(waiter) = entry.queue.pop_front() else {
                break;
            };
            let token = new_token(lock_name, waiter.mode, term, now + ttl);
            let holder = HolderInfo {
                token_id: token.token_id,
                mode: token.mode,
                expires_at: token.expiry,
            };
            if waiter.grant.send(Ok(token)).is_ok() {
                entry.add_holder(holder);
            }
        }
    }
}

fn new_token(lock_name: &str, mode: LockMode, term: Term, expiry: Instant) -> LockToken {
    LockToken {
        token_id: Uuid::new_v4(),
        lock_name: lock_name.to_string(),
        mode,
        term,
        expiry,
    }
}

/// Shared/exclusive locks served by the current leader.
///
/// All state lives in memory and belongs to a single term. Losing leadership
/// fails every waiter and forgets every holder; a new leader starts empty.
pub struct LockManager {
    leadership: Arc<dyn Leadership>,
    gate: Arc<AvailabilityGate>,
    config: LockConfig,
    table: Mutex<LockTable>,
}

enum Woken {
    Granted(std::result::Result<Result<LockToken>, oneshot::error::RecvError>),
    TimedOut,
    Cancelled,
}

/// A queued acquisition. Dropping it before completion withdraws the waiter
/// and releases any grant that raced with the drop.
struct QueuedWait<'a> {
    manager: &'a LockManager,
    request: LockRequest,
    rx: oneshot::Receiver<Result<LockToken>>,
    finished: bool,
}

impl QueuedWait<'_> {
    async fn wait(&mut self, term: Term, started: Instant, cancel: &CancellationToken) -> Result<LockToken> {
        let woken = tokio::select! {
            granted = &mut self.rx => Woken::Granted(granted),
            _ = tokio::time::sleep_until(self.request.deadline) => Woken::TimedOut,
            _ = cancel.cancelled() => Woken::Cancelled,
        };

        match woken {
            Woken::Granted(granted) => {
                self.finished = true;
                let token = granted.unwrap_or(Err(TimelockError::LeaderLost { term: term.number }))?;
                self.manager.confirm_grant(token)
            }
            Woken::TimedOut => match self.withdraw() {
                // Granted at the deadline; the caller still gets it.
                Some(delivered) => delivered.and_then(|token| self.manager.confirm_grant(token)),
                None => Err(TimelockError::BlockingTimeout {
                    lock_name: self.request.lock_name.clone(),
                    waited: started.elapsed(),
                }),
            },
            Woken::Cancelled => {
                if let Some(Ok(token)) = self.withdraw() {
                    self.manager.release(&token);
                }
                Err(TimelockError::Cancelled)
            }
        }
    }

    /// Leave the queue. If the waiter was already dequeued, returns what was
    /// delivered to it.
    fn withdraw(&mut self) -> Option<Result<LockToken>> {
        self.finished = true;
        {
            let mut table = self.manager.table.lock();
            let term = self.manager.bind_term(&mut table).ok();
            if let Some(entry) = table.locks.get_mut(&self.request.lock_name) {
                if entry.remove_waiter(self.request.requester_id) {
                    // The withdrawn waiter may have been blocking the ones behind it.
                    if let Some(term) = term {
                        LockTable::grant_waiters(
                            entry,
                            &self.request.lock_name,
                            term,
                            self.manager.config.token_ttl,
                            Instant::now(),
                        );
                    }
                    if entry.is_idle() {
                        table.locks.remove(&self.request.lock_name);
                    }
                    return None;
                }
            }
        }
        self.rx.try_recv().ok()
    }
}

impl Drop for QueuedWait<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        tracing::debug!(
            lock = %self.request.lock_name,
            requester = %self.request.requester_id,
            "lock waiter dropped"
        );
        if let Some(Ok(token)) = self.withdraw() {
            self.manager.release(&token);
        }
    }
}

impl LockManager {
    pub fn new(leadership: Arc<dyn Leadership>, gate: Arc<AvailabilityGate>, config: LockConfig) -> Self {
        Self {
            leadership,
            gate,
            config,
            table: Mutex::new(LockTable::default()),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Acquire with the configured default wait budget.
    pub async fn acquire_default(&self, lock_name: &str, mode: LockMode) -> Result<LockToken> {
        self.acquire(lock_name, mode, self.config.default_timeout).await
    }

    /// Acquire `lock_name` in `mode`, waiting up to `timeout`.
    ///
    /// A zero timeout never waits. Dropping the returned future gives up the
    /// place in the queue.
    pub async fn acquire(&self, lock_name: &str, mode: LockMode, timeout: Duration) -> Result<LockToken> {
        self.acquire_cancellable(lock_name, mode, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`acquire`](Self::acquire), but also gives up when `cancel` fires.
    pub async fn acquire_cancellable(
        &self,
        lock_name: &str,
        mode: LockMode,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<LockToken> {
        self.gate.check()?;
        let started = Instant::now();
        let request = LockRequest {
            lock_name: lock_name.to_string(),
            mode,
            requester_id: Uuid::new_v4(),
            deadline: started + timeout,
        };

        let (term, rx) = {
            let mut table = self.table.lock();
            let term = self.bind_term(&mut table)?;

            let now = Instant::now();
            let ttl = self.config.token_ttl;
            let entry = table.locks.entry(request.lock_name.clone()).or_default();
            if entry.remove_expired(now) {
                LockTable::grant_waiters(entry, lock_name, term, ttl, now);
            }

            if entry.can_acquire(mode) {
                let token = new_token(lock_name, mode, term, now + ttl);
                entry.add_holder(HolderInfo {
                    token_id: token.token_id,
                    mode,
                    expires_at: token.expiry,
                });
                tracing::debug!(lock = lock_name, ?mode, token = %token.token_id, "lock granted");
                return Ok(token);
            }
            if timeout.is_zero() {
                return Err(TimelockError::BlockingTimeout {
                    lock_name: request.lock_name,
                    waited: Duration::ZERO,
                });
            }
            if entry.queue.len() >= self.config.max_queue_depth {
                return Err(TimelockError::ServiceUnavailable(format!(
                    "wait queue for lock {} is full ({} waiters)",
                    lock_name,
                    entry.queue.len()
                )));
            }

            let (tx, rx) = oneshot::channel();
            entry.queue.push_back(Waiter {
                id: request.requester_id,
                mode,
                grant: tx,
            });
            (term, rx)
        };

        tracing::debug!(lock = lock_name, ?mode, requester = %request.requester_id, "lock request queued");
        let mut queued = QueuedWait {
            manager: self,
            request,
            rx,
            finished: false,
        };
        queued.wait(term, started, cancel).await
    }

    /// Release a token. Idempotent: returns `false` if the token was already
    /// released, expired, or belongs to an earlier term.
    pub fn release(&self, token: &LockToken) -> bool {
        let mut table = self.table.lock();
        if table.term != Some(token.term) {
            return false;
        }
        let Some(entry) = table.locks.get_mut(&token.lock_name) else {
            return false;
        };
        if !entry.remove_holder(token.token_id) {
            return false;
        }
        tracing::debug!(lock = %token.lock_name, token = %token.token_id, "lock released");

        // Waiters are only granted while the lease for the token's term holds.
        if self.bind_term(&mut table).ok() != Some(token.term) {
            return true;
        }
        if let Some(entry) = table.locks.get_mut(&token.lock_name) {
            LockTable::grant_waiters(
                entry,
                &token.lock_name,
                token.term,
                self.config.token_ttl,
                Instant::now(),
            );
            if entry.is_idle() {
                table.locks.remove(&token.lock_name);
            }
        }
        true
    }

    /// Whether `token` is a live holder under the current term.
    pub fn validate(&self, token: &LockToken) -> bool {
        match self.leadership.ensure_leader() {
            Ok(term) if term == token.term => {}
            _ => return false,
        }
        let table = self.table.lock();
        if table.term != Some(token.term) {
            return false;
        }
        table
            .locks
            .get(&token.lock_name)
            .and_then(|entry| entry.holder(token.token_id))
            .map_or(false, |holder| holder.expires_at > Instant::now())
    }

    /// Extend the expiry of every still-valid token; returns the refreshed set.
    pub fn refresh(&self, tokens: &[LockToken]) -> Result<Vec<LockToken>> {
        self.gate.check()?;
        let term = self.leadership.ensure_leader()?;
        let now = Instant::now();
        let expiry = now + self.config.token_ttl;

        let mut table = self.table.lock();
        if table.term != Some(term) {
            return Ok(Vec::new());
        }
        let mut refreshed = Vec::new();
        for token in tokens.iter().filter(|t| t.term == term) {
            let Some(entry) = table.locks.get_mut(&token.lock_name) else {
                continue;
            };
            let live = entry
                .holder(token.token_id)
                .map_or(false, |h| h.expires_at > now);
            if live && entry.extend_ttl(token.token_id, expiry) {
                refreshed.push(LockToken {
                    expiry,
                    ..token.clone()
                });
            }
        }
        Ok(refreshed)
    }

    /// Drop expired holders everywhere and grant whoever they were blocking.
    /// Returns how many holders were reaped.
    pub fn reap_expired(&self) -> usize {
        let mut table = self.table.lock();
        let Ok(term) = self.bind_term(&mut table) else {
            return 0;
        };
        let now = Instant::now();
        let ttl = self.config.token_ttl;
        let mut reaped = 0;
        for (name, entry) in table.locks.iter_mut() {
            let before = entry.holders.len();
            if entry.remove_expired(now) {
                reaped += before - entry.holders.len();
                LockTable::grant_waiters(entry, name, term, ttl, now);
            }
        }
        table.locks.retain(|_, entry| !entry.is_idle());
        reaped
    }

    /// Apply a leadership change: anything not belonging to a term this node
    /// currently leads is discarded.
    pub fn on_leadership_change(&self, status: LeadershipStatus) {
        let target = if status.is_leader { status.term } else { None };
        let mut table = self.table.lock();
        if table.term == target {
            return;
        }
        let previous = table.term;
        match table.fence(target) {
            Ok(failed) => tracing::info!(
                "lock table fenced: term {:?} -> {:?}, {} waiters failed",
                previous.map(|t| t.number),
                target.map(|t| t.number),
                failed
            ),
            Err(e) => tracing::debug!("stale leadership status ignored: {}", e),
        }
    }

    /// Re-check the lease and bind the table to the term this node leads
    /// right now. A lapsed lease fences the table to no term at all.
    fn bind_term(&self, table: &mut LockTable) -> Result<Term> {
        let current = self.leadership.ensure_leader();
        let target = current.as_ref().ok().copied();
        if table.term != target {
            let previous = table.term;
            let failed = table.fence(target)?;
            tracing::info!(
                "lock table fenced: term {:?} -> {:?}, {} waiters failed",
                previous.map(|t| t.number),
                target.map(|t| t.number),
                failed
            );
        }
        current
    }

    /// Hand a dequeued grant to its caller only if its term is still led.
    fn confirm_grant(&self, token: LockToken) -> Result<LockToken> {
        let mut table = self.table.lock();
        match self.bind_term(&mut table) {
            Ok(term) if term == token.term => Ok(token),
            _ => Err(TimelockError::LeaderLost {
                term: token.term.number,
            }),
        }
    }

    /// Waiters currently queued on `lock_name`.
    pub fn queue_depth(&self, lock_name: &str) -> usize {
        self.table
            .lock()
            .locks
            .get(lock_name)
            .map_or(0, |e| e.queue.len())
    }

    /// Holders currently recorded for `lock_name`.
    pub fn holder_count(&self, lock_name: &str) -> usize {
        self.table
            .lock()
            .locks
            .get(lock_name)
            .map_or(0, |e| e.holders.len())
    }

    /// Background task: fence the table on every leadership change.
    pub async fn run_fencing(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut status = self.leadership.subscribe();
        let initial = *status.borrow_and_update();
        self.on_leadership_change(initial);

        loop {
            tokio::select! {
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = *status.borrow_and_update();
                    self.on_leadership_change(current);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.on_leadership_change(LeadershipStatus::default());
        tracing::info!("lock fencing task stopped");
    }

    /// Background task: sweep expired holders every `reaper_interval`.
    pub async fn run_reaper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let reaped = self.reap_expired();
                    if reaped > 0 {
                        tracing::debug!(reaped, "expired lock holders reaped");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paxos::{Acceptor, AcceptorClient, ElectionConfig, InMemoryProposalLog, LeaderElector, Proposer};
    use crate::testing::SwitchableLeader;

    const SECOND: Duration = Duration::from_secs(1);

    fn manager_with(leader: Arc<SwitchableLeader>, config: LockConfig) -> Arc<LockManager> {
        Arc::new(LockManager::new(
            leader,
            Arc::new(AvailabilityGate::ready()),
            config,
        ))
    }

    fn manager() -> (Arc<LockManager>, Arc<SwitchableLeader>) {
        let leader = SwitchableLeader::new(1);
        (manager_with(leader.clone(), LockConfig::default()), leader)
    }

    #[tokio::test]
    async fn test_exclusive_excludes() {
        let (mgr, _) = manager();
        let token = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        assert!(mgr.validate(&token));

        let err = mgr
            .acquire("row", LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TimelockError::BlockingTimeout { waited, .. } if waited == Duration::ZERO
        ));
        let err = mgr
            .acquire("row", LockMode::Shared, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TimelockError::BlockingTimeout { .. }));
        assert_eq!(mgr.queue_depth("row"), 0);

        // Other names are independent.
        mgr.acquire("other", LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shared_holders_coexist() {
        let (mgr, _) = manager();
        let a = mgr.acquire("t", LockMode::Shared, Duration::ZERO).await.unwrap();
        let b = mgr.acquire("t", LockMode::Shared, Duration::ZERO).await.unwrap();
        assert_ne!(a.token_id, b.token_id);
        assert_eq!(mgr.holder_count("t"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_boundary() {
        let (mgr, _) = manager();
        let _held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();

        let timeout = Duration::from_millis(100);
        let started = Instant::now();
        let err = mgr
            .acquire("row", LockMode::Exclusive, timeout)
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(10));
        assert!(matches!(err, TimelockError::BlockingTimeout { .. }));
        assert!(err.is_retryable());
        assert_eq!(err.http_status(), 503);
        assert_eq!(mgr.queue_depth("row"), 0);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (mgr, _) = manager();
        let token = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        assert!(mgr.release(&token));
        assert!(!mgr.release(&token));
        assert!(!mgr.validate(&token));
        mgr.acquire("row", LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_fifo_without_barging() {
        let (mgr, _) = manager();
        let shared = mgr.acquire("t", LockMode::Shared, SECOND).await.unwrap();

        let writer = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("t", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("t") == 0 {
            tokio::task::yield_now().await;
        }

        // Compatible with the holder, but the queued writer goes first.
        let err = mgr
            .acquire("t", LockMode::Shared, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TimelockError::BlockingTimeout { .. }));

        assert!(mgr.release(&shared));
        let token = writer.await.unwrap().unwrap();
        assert_eq!(token.mode, LockMode::Exclusive);
        assert!(mgr.validate(&token));
    }

    #[tokio::test]
    async fn test_release_grants_shared_run_then_exclusive() {
        let (mgr, _) = manager();
        let writer = mgr.acquire("t", LockMode::Exclusive, SECOND).await.unwrap();

        let mut waiters = Vec::new();
        for mode in [LockMode::Shared, LockMode::Shared, LockMode::Exclusive, LockMode::Shared] {
            let mgr_clone = Arc::clone(&mgr);
            waiters.push(tokio::spawn(async move {
                mgr_clone.acquire("t", mode, 10 * SECOND).await
            }));
            let expected = waiters.len();
            while mgr.queue_depth("t") < expected {
                tokio::task::yield_now().await;
            }
        }

        assert!(mgr.release(&writer));
        // The two leading shared waiters are granted together.
        assert_eq!(mgr.holder_count("t"), 2);
        assert_eq!(mgr.queue_depth("t"), 2);

        let mut waiters = waiters.into_iter();
        let s1 = waiters.next().unwrap().await.unwrap().unwrap();
        let s2 = waiters.next().unwrap().await.unwrap().unwrap();
        assert!(mgr.release(&s1));
        assert_eq!(mgr.holder_count("t"), 1);
        assert!(mgr.release(&s2));

        // Then the exclusive one alone; the trailing shared waiter stays queued.
        assert_eq!(mgr.holder_count("t"), 1);
        assert_eq!(mgr.queue_depth("t"), 1);
        let x = waiters.next().unwrap().await.unwrap().unwrap();
        assert_eq!(x.mode, LockMode::Exclusive);
        assert!(mgr.release(&x));
        let s3 = waiters.next().unwrap().await.unwrap().unwrap();
        assert_eq!(s3.mode, LockMode::Shared);
    }

    #[tokio::test]
    async fn test_term_change_fences_waiters_and_tokens() {
        let (mgr, leader) = manager();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let fencing = tokio::spawn(Arc::clone(&mgr).run_fencing(shutdown_rx));
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();

        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("row", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }

        let new_term = leader.advance();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TimelockError::LeaderLost { term: 1 }));

        assert!(!mgr.validate(&held));
        assert!(!mgr.release(&held));

        // Nothing from the old term survives; the lock is free in the new one.
        let token = mgr
            .acquire("row", LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(token.term, new_term);
        fencing.abort();
    }

    #[tokio::test]
    async fn test_acquire_after_stepping_down_is_redirected() {
        let (mgr, leader) = manager();
        leader.set(None);
        let err = mgr
            .acquire("row", LockMode::Shared, SECOND)
            .await
            .unwrap_err();
        assert_eq!(err.leader_hint(), Some(2));
    }

    #[tokio::test]
    async fn test_cancellation_frees_queue_slot() {
        let (mgr, _) = manager();
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.acquire_cancellable("row", LockMode::Exclusive, 10 * SECOND, &cancel)
                    .await
            })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TimelockError::Cancelled)
        ));
        assert_eq!(mgr.queue_depth("row"), 0);

        // Releasing does not hand the lock to the cancelled waiter.
        assert!(mgr.release(&held));
        assert_eq!(mgr.holder_count("row"), 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_frees_queue_slot() {
        let (mgr, _) = manager();
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            mgr.acquire("row", LockMode::Exclusive, 10 * SECOND),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(mgr.queue_depth("row"), 0);

        assert!(mgr.release(&held));
        assert_eq!(mgr.holder_count("row"), 0);
    }

    #[tokio::test]
    async fn test_withdrawn_head_unblocks_followers() {
        let (mgr, _) = manager();
        let reader = mgr.acquire("t", LockMode::Shared, SECOND).await.unwrap();

        let cancel = CancellationToken::new();
        let writer = {
            let mgr = Arc::clone(&mgr);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                mgr.acquire_cancellable("t", LockMode::Exclusive, 10 * SECOND, &cancel)
                    .await
            })
        };
        while mgr.queue_depth("t") == 0 {
            tokio::task::yield_now().await;
        }
        let second_reader = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("t", LockMode::Shared, 10 * SECOND).await })
        };
        while mgr.queue_depth("t") < 2 {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        assert!(writer.await.unwrap().is_err());
        let token = second_reader.await.unwrap().unwrap();
        assert!(mgr.validate(&token));
        assert!(mgr.validate(&reader));
    }

    #[tokio::test]
    async fn test_queue_depth_limit() {
        let leader = SwitchableLeader::new(1);
        let mgr = manager_with(
            leader,
            LockConfig {
                max_queue_depth: 1,
                ..LockConfig::default()
            },
        );
        let _held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        let _first = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("row", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }
        let err = mgr
            .acquire("row", LockMode::Exclusive, SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, TimelockError::ServiceUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_is_reaped_and_waiter_granted() {
        let leader = SwitchableLeader::new(1);
        let mgr = manager_with(
            leader,
            LockConfig {
                token_ttl: Duration::from_millis(100),
                ..LockConfig::default()
            },
        );
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("row", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(!mgr.validate(&held));
        assert_eq!(mgr.reap_expired(), 1);
        let token = waiter.await.unwrap().unwrap();
        assert!(mgr.validate(&token));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_extends_live_tokens_only() {
        let leader = SwitchableLeader::new(1);
        let mgr = manager_with(
            leader,
            LockConfig {
                token_ttl: Duration::from_millis(100),
                ..LockConfig::default()
            },
        );
        let a = mgr.acquire("a", LockMode::Shared, SECOND).await.unwrap();
        let b = mgr.acquire("b", LockMode::Shared, SECOND).await.unwrap();
        assert!(mgr.release(&b));

        tokio::time::advance(Duration::from_millis(60)).await;
        let refreshed = mgr.refresh(&[a.clone(), b]).unwrap();
        assert_eq!(refreshed.len(), 1);
        assert_eq!(refreshed[0].token_id, a.token_id);
        assert!(refreshed[0].expiry > a.expiry);

        tokio::time::advance(Duration::from_millis(60)).await;
        // Past the original expiry, but refreshed.
        assert!(mgr.validate(&refreshed[0]));
    }

    #[tokio::test]
    async fn test_not_initialized_until_gate_opens() {
        let gate = Arc::new(AvailabilityGate::new());
        let mgr = LockManager::new(SwitchableLeader::new(1), gate.clone(), LockConfig::default());
        let err = mgr
            .acquire("row", LockMode::Shared, SECOND)
            .await
            .unwrap_err();
        assert!(matches!(err, TimelockError::NotInitialized { .. }));
        gate.mark_ready();
        mgr.acquire("row", LockMode::Shared, SECOND).await.unwrap();
    }

    fn elected_manager(config: LockConfig) -> (Arc<LockManager>, Arc<LeaderElector>) {
        let acceptor: Arc<dyn AcceptorClient> =
            Arc::new(Acceptor::new(1, Arc::new(InMemoryProposalLog::new())));
        let proposer = Proposer::new(1, vec![acceptor], Duration::from_millis(100));
        let elector = Arc::new(LeaderElector::new(Arc::new(proposer), ElectionConfig::default()));
        let mgr = Arc::new(LockManager::new(
            elector.clone(),
            Arc::new(AvailabilityGate::ready()),
            config,
        ));
        (mgr, elector)
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_lease_lapse_fails_waiters() {
        let (mgr, elector) = elected_manager(LockConfig::default());
        elector.campaign().await.unwrap();
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("row", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }

        // No step-down has been published yet; only the lease has run out.
        tokio::time::advance(ElectionConfig::default().lease_duration + Duration::from_millis(1)).await;
        assert!(mgr.release(&held));

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TimelockError::LeaderLost { term: 1 }));
        assert_eq!(mgr.holder_count("row"), 0);
        assert!(elector.ensure_leader().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaper_after_lease_lapse_fails_waiters() {
        let (mgr, elector) = elected_manager(LockConfig {
            token_ttl: Duration::from_millis(100),
            ..LockConfig::default()
        });
        elector.campaign().await.unwrap();
        let _held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.acquire("row", LockMode::Exclusive, 10 * SECOND).await })
        };
        while mgr.queue_depth("row") == 0 {
            tokio::task::yield_now().await;
        }

        tokio::time::advance(ElectionConfig::default().lease_duration + Duration::from_millis(1)).await;
        assert_eq!(mgr.reap_expired(), 0);
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, TimelockError::LeaderLost { term: 1 }));
        assert_eq!(mgr.holder_count("row"), 0);
    }

    #[test]
    fn test_fence_never_moves_to_an_older_term() {
        let older = Term {
            number: 1,
            leader_id: 1,
        };
        let newer = Term {
            number: 2,
            leader_id: 3,
        };
        let mut table = LockTable::default();
        assert_eq!(table.fence(Some(newer)).unwrap(), 0);
        assert!(matches!(
            table.fence(Some(older)),
            Err(TimelockError::LeaderLost { term: 1 })
        ));
        assert_eq!(table.term, Some(newer));

        // Stepping down does not reopen older terms either.
        table.fence(None).unwrap();
        assert!(table.fence(Some(older)).is_err());
        assert_eq!(table.fence(Some(newer)).unwrap(), 0);
        assert_eq!(table.term, Some(newer));
    }

    #[tokio::test]
    async fn test_stale_term_cannot_rebind_table() {
        let leader = SwitchableLeader::new(2);
        let mgr = manager_with(leader.clone(), LockConfig::default());
        let held = mgr.acquire("row", LockMode::Exclusive, SECOND).await.unwrap();

        leader.set(Some(Term {
            number: 1,
            leader_id: 1,
        }));
        let err = mgr
            .acquire("other", LockMode::Exclusive, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, TimelockError::LeaderLost { term: 1 }));
        assert_eq!(mgr.holder_count("row"), 1);

        leader.set(Some(held.term));
        assert!(mgr.validate(&held));
    }
}
