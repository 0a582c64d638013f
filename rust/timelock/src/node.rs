//! Node facade.
//!
//! A [`TimelockNode`] wires the availability gate, leadership, the timestamp
//! service and the lock manager together and exposes the client-facing
//! operations. Transport is external: a server binding hands requests to
//! these methods, and peers reach the local acceptor through
//! [`TimelockNode::acceptor`].
//!
//! Paxos mode:
//!
//! ```text
//!   DeferredProposalLog ◄── AsyncInitializer (opens paxos.redb, opens gate)
//!          │
//!      Acceptor (local) ──┐
//!   peer AcceptorClients ─┴─► Proposer ──┬──► LeaderElector ──► Leadership
//!                                        └──► PaxosBoundStore
//! ```
//!
//! KV mode runs a [`SoleLeader`] over a [`KvBoundStore`] opened the same way.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{Mode, PaxosConfig, TimelockConfig};
use crate::error::{Result, TimelockError};
use crate::gate::{AsyncInitializer, AvailabilityGate, INIT_BACKOFF_CAP};
use crate::lock::{LockConfig, LockManager, LockMode, LockToken};
use crate::paxos::{
    Acceptor, AcceptorClient, DeferredProposalLog, LeaderElector, Leadership, NodeId, Proposer,
    RedbProposalLog, SoleLeader, Term,
};
use crate::timestamp::{
    AllocatorConfig, DeferredBoundStore, KvBoundStore, PaxosBoundStore, TimestampBoundStore,
    TimestampRange, TimestampService,
};

/// Store opened in the background before the gate opens.
enum StoreInit {
    ProposalLog {
        log: Arc<DeferredProposalLog>,
        path: PathBuf,
    },
    BoundStore {
        store: Arc<DeferredBoundStore>,
        path: PathBuf,
    },
}

impl StoreInit {
    fn name(&self) -> &'static str {
        match self {
            StoreInit::ProposalLog { .. } => "paxos proposal log",
            StoreInit::BoundStore { .. } => "kv timestamp bound store",
        }
    }

    fn attempt(&self) -> BoxFuture<'static, Result<()>> {
        match self {
            StoreInit::ProposalLog { log, path } => {
                let log = Arc::clone(log);
                let path = path.clone();
                async move {
                    let opened = tokio::task::spawn_blocking(move || RedbProposalLog::open(path))
                        .await
                        .map_err(|e| TimelockError::StorageFailure(e.to_string()))??;
                    log.install(Arc::new(opened));
                    Ok(())
                }
                .boxed()
            }
            StoreInit::BoundStore { store, path } => {
                let store = Arc::clone(store);
                let path = path.clone();
                async move {
                    let opened = tokio::task::spawn_blocking(move || KvBoundStore::open(path))
                        .await
                        .map_err(|e| TimelockError::StorageFailure(e.to_string()))??;
                    store.install(Arc::new(opened));
                    Ok(())
                }
                .boxed()
            }
        }
    }
}

/// One member of a timelock cluster.
pub struct TimelockNode {
    node_id: NodeId,
    gate: Arc<AvailabilityGate>,
    leadership: Arc<dyn Leadership>,
    elector: Option<Arc<LeaderElector>>,
    acceptor: Option<Arc<Acceptor>>,
    timestamps: TimestampService,
    locks: Arc<LockManager>,
    store_init: Mutex<Option<StoreInit>>,
    init_backoff_cap: Duration,
}

impl TimelockNode {
    /// Build a node from validated configuration.
    ///
    /// `peers` are clients for every other member's acceptor, supplied by the
    /// transport layer. The local acceptor is created here over a proposal
    /// log that opens in the background once [`start`](Self::start) runs.
    pub fn from_config(config: &TimelockConfig, peers: Vec<Arc<dyn AcceptorClient>>) -> Result<Self> {
        config.validate()?;
        let node_id = config.cluster.local_node_id;
        let lock = config.async_lock.lock_config();
        let gate = Arc::new(AvailabilityGate::new());

        match config.mode()? {
            Mode::Paxos(paxos) => {
                let members = config.servers()?.len();
                if peers.len() + 1 != members {
                    return Err(TimelockError::Config(format!(
                        "cluster has {} members but {} peer acceptors were supplied",
                        members,
                        peers.len()
                    )));
                }

                let log = Arc::new(DeferredProposalLog::new());
                let local = Arc::new(Acceptor::new(node_id, log.clone()));
                let mut acceptors = vec![local.clone() as Arc<dyn AcceptorClient>];
                acceptors.extend(peers);

                let mut node = Self::paxos(node_id, acceptors, Some(local), paxos, lock, gate);
                node.store_init = Mutex::new(Some(StoreInit::ProposalLog {
                    log,
                    path: paxos.log_path(),
                }));
                node.init_backoff_cap = Duration::from_millis(paxos.init_backoff_cap_ms);
                Ok(node)
            }
            Mode::Kvs(kvs) => {
                let store = Arc::new(DeferredBoundStore::new());
                let mut node =
                    Self::sole_leader(node_id, store.clone(), kvs.allocator_config(), lock, gate);
                node.store_init = Mutex::new(Some(StoreInit::BoundStore {
                    store,
                    path: kvs.path.clone(),
                }));
                Ok(node)
            }
        }
    }

    /// A Paxos-mode node over caller-supplied acceptors.
    ///
    /// `acceptors` must include this node's own acceptor. The gate is owned
    /// by the caller, who opens it once the acceptors' logs are usable.
    pub fn paxos(
        node_id: NodeId,
        acceptors: Vec<Arc<dyn AcceptorClient>>,
        local: Option<Arc<Acceptor>>,
        paxos: &PaxosConfig,
        lock: LockConfig,
        gate: Arc<AvailabilityGate>,
    ) -> Self {
        let proposer = Arc::new(Proposer::new(node_id, acceptors, paxos.rpc_timeout()));
        let elector = Arc::new(LeaderElector::new(
            Arc::clone(&proposer),
            paxos.election_config(),
        ));
        let store = Arc::new(PaxosBoundStore::new(proposer, paxos.max_round_attempts));
        let leadership: Arc<dyn Leadership> = elector.clone();

        let mut node = Self::assemble(
            node_id,
            leadership,
            store,
            paxos.allocator_config(),
            lock,
            gate,
        );
        node.elector = Some(elector);
        node.acceptor = local;
        node
    }

    /// A single-node deployment leading a static term over `store`.
    pub fn sole_leader(
        node_id: NodeId,
        store: Arc<dyn TimestampBoundStore>,
        allocator: AllocatorConfig,
        lock: LockConfig,
        gate: Arc<AvailabilityGate>,
    ) -> Self {
        Self::assemble(
            node_id,
            Arc::new(SoleLeader::new(node_id)),
            store,
            allocator,
            lock,
            gate,
        )
    }

    fn assemble(
        node_id: NodeId,
        leadership: Arc<dyn Leadership>,
        store: Arc<dyn TimestampBoundStore>,
        allocator: AllocatorConfig,
        lock: LockConfig,
        gate: Arc<AvailabilityGate>,
    ) -> Self {
        let timestamps = TimestampService::new(
            Arc::clone(&leadership),
            Arc::clone(&gate),
            store,
            allocator,
        );
        let locks = Arc::new(LockManager::new(
            Arc::clone(&leadership),
            Arc::clone(&gate),
            lock,
        ));
        Self {
            node_id,
            gate,
            leadership,
            elector: None,
            acceptor: None,
            timestamps,
            locks,
            store_init: Mutex::new(None),
            init_backoff_cap: INIT_BACKOFF_CAP,
        }
    }

    /// Spawn the background tasks: store initializer, leader elector, lock
    /// fencing and lock reaper. They exit when `shutdown` flips to `true`.
    pub fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(init) = self.store_init.lock().take() {
            let gate = Arc::clone(&self.gate);
            let initializer = AsyncInitializer::new(init.name()).with_backoff_cap(self.init_backoff_cap);
            let shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                initializer.run(&gate, || init.attempt(), shutdown).await;
            }));
        }
        if let Some(elector) = &self.elector {
            tasks.push(tokio::spawn(Arc::clone(elector).run(shutdown.clone())));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.locks).run_fencing(shutdown.clone())));
        tasks.push(tokio::spawn(Arc::clone(&self.locks).run_reaper(shutdown)));

        tracing::info!(node_id = self.node_id, tasks = tasks.len(), "timelock node started");
        tasks
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The local acceptor, for the transport to serve to peers.
    pub fn acceptor(&self) -> Option<Arc<Acceptor>> {
        self.acceptor.clone()
    }

    pub fn gate(&self) -> &Arc<AvailabilityGate> {
        &self.gate
    }

    pub fn leadership(&self) -> &Arc<dyn Leadership> {
        &self.leadership
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    /// Wait until the backing store is reachable or `deadline` passes.
    pub async fn await_ready(&self, deadline: Instant) -> Result<()> {
        self.gate.await_ready_or_error(deadline).await
    }

    /// Whether this node currently leads under a live lease.
    pub fn is_leader(&self) -> bool {
        self.leadership.ensure_leader().is_ok()
    }

    pub async fn get_fresh_timestamp(&self) -> Result<u64> {
        self.timestamps.get_fresh_timestamp().await
    }

    pub async fn get_fresh_timestamps(&self, count: u32) -> Result<TimestampRange> {
        self.timestamps.get_fresh_timestamps(count).await
    }

    /// The highest leadership term this node knows of, if any.
    pub fn get_current_term(&self) -> Option<Term> {
        self.leadership.current_term()
    }

    pub async fn lock_acquire(&self, lock_name: &str, mode: LockMode, timeout_millis: u32) -> Result<LockToken> {
        self.locks
            .acquire(lock_name, mode, Duration::from_millis(u64::from(timeout_millis)))
            .await
    }

    /// Acquire that also gives up when the caller's connection goes away.
    pub async fn lock_acquire_cancellable(
        &self,
        lock_name: &str,
        mode: LockMode,
        timeout_millis: u32,
        cancel: &CancellationToken,
    ) -> Result<LockToken> {
        self.locks
            .acquire_cancellable(
                lock_name,
                mode,
                Duration::from_millis(u64::from(timeout_millis)),
                cancel,
            )
            .await
    }

    /// Release a token. Releasing an unknown, expired or fenced token is a
    /// no-op.
    pub fn lock_release(&self, token: &LockToken) -> Result<()> {
        self.gate.check()?;
        if !self.locks.release(token) {
            tracing::debug!(lock = %token.lock_name, token = %token.token_id, "release of inactive token ignored");
        }
        Ok(())
    }

    /// Extend the lease of every still-held token.
    pub fn lock_refresh(&self, tokens: &[LockToken]) -> Result<Vec<LockToken>> {
        self.locks.refresh(tokens)
    }

    /// Whether `token` still guards its lock.
    pub fn lock_validate(&self, token: &LockToken) -> bool {
        self.locks.validate(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AsyncLockConfig, ClusterConfig, KvsConfig};
    use crate::paxos::InMemoryProposalLog;
    use crate::storage::RedbStore;

    fn kvs_config(path: PathBuf) -> TimelockConfig {
        TimelockConfig {
            cluster: ClusterConfig {
                local_node_id: 1,
                servers: vec!["1@127.0.0.1:8421".into()],
                tls: None,
            },
            paxos: None,
            kvs: Some(KvsConfig {
                path,
                timestamp_batch_size: 100,
                reservation_timeout_ms: 1_000,
            }),
            async_lock: AsyncLockConfig::default(),
        }
    }

    fn paxos_config(dir: PathBuf) -> TimelockConfig {
        TimelockConfig {
            cluster: ClusterConfig {
                local_node_id: 1,
                servers: vec!["1@127.0.0.1:8421".into()],
                tls: None,
            },
            paxos: Some(PaxosConfig {
                data_directory: dir,
                ..PaxosConfig::default()
            }),
            kvs: None,
            async_lock: AsyncLockConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_kvs_node_serves_after_store_opens() {
        let dir = tempfile::tempdir().unwrap();
        let node = TimelockNode::from_config(&kvs_config(dir.path().join("kvs.redb")), Vec::new())
            .unwrap();
        assert!(matches!(
            node.get_fresh_timestamp().await,
            Err(TimelockError::NotInitialized { .. })
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = node.start(shutdown_rx);
        node.await_ready(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let a = node.get_fresh_timestamp().await.unwrap();
        let b = node.get_fresh_timestamp().await.unwrap();
        assert!(b > a);
        assert_eq!(node.get_current_term().map(|t| t.number), Some(1));

        shutdown_tx.send(true).unwrap();
        for task in tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_single_member_paxos_node_elects_itself() {
        let dir = tempfile::tempdir().unwrap();
        let node = TimelockNode::from_config(&paxos_config(dir.path().to_path_buf()), Vec::new())
            .unwrap();
        assert!(node.acceptor().is_some());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let _tasks = node.start(shutdown_rx);
        node.await_ready(Instant::now() + Duration::from_secs(5))
            .await
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while !node.is_leader() {
            assert!(Instant::now() < deadline, "node never became leader");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let range = node.get_fresh_timestamps(10).await.unwrap();
        assert_eq!(range.len(), 10);
        assert!(dir.path().join(crate::config::PAXOS_LOG_FILE).exists());
        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_peer_count_must_match_membership() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = paxos_config(dir.path().to_path_buf());
        config.cluster.servers.push("2@127.0.0.1:8422".into());
        assert!(matches!(
            TimelockNode::from_config(&config, Vec::new()),
            Err(TimelockError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_operations_through_node() {
        let store = KvBoundStore::with_store(&RedbStore::open_temporary().unwrap()).unwrap();
        let node = TimelockNode::sole_leader(
            7,
            Arc::new(store),
            AllocatorConfig::default(),
            LockConfig::default(),
            Arc::new(AvailabilityGate::ready()),
        );

        let token = node.lock_acquire("table/a", LockMode::Exclusive, 0).await.unwrap();
        assert_eq!(token.term.leader_id, 7);
        assert!(matches!(
            node.lock_acquire("table/a", LockMode::Exclusive, 0).await,
            Err(TimelockError::BlockingTimeout { .. })
        ));

        let refreshed = node.lock_refresh(std::slice::from_ref(&token)).unwrap();
        assert_eq!(refreshed.len(), 1);
        assert!(node.lock_validate(&token));

        node.lock_release(&token).unwrap();
        node.lock_release(&token).unwrap();
        assert!(!node.lock_validate(&token));
        node.lock_acquire("table/a", LockMode::Exclusive, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_paxos_node_with_injected_acceptors() {
        let log = Arc::new(InMemoryProposalLog::new());
        let local = Arc::new(Acceptor::new(1, log));
        let config = PaxosConfig::default();
        let node = TimelockNode::paxos(
            1,
            vec![local.clone() as Arc<dyn AcceptorClient>],
            Some(local),
            &config,
            LockConfig::default(),
            Arc::new(AvailabilityGate::ready()),
        );
        assert!(matches!(
            node.get_fresh_timestamp().await,
            Err(TimelockError::NotCurrentLeader { .. })
        ));
        assert_eq!(node.get_current_term(), None);
    }
}
