//! Durable per-node record of promises and accepted proposals.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::types::{LogNamespace, Proposal, Round};
use crate::storage::{RedbStore, RedbTree, Result, StorageError};

/// Tree holding the promised round of every namespace, keyed by namespace name.
pub const PROMISED_TREE: &str = "paxos_promised";

/// Prefix of the per-namespace accepted-proposal trees, keyed by big-endian round.
pub const ACCEPTED_TREE_PREFIX: &str = "paxos_accepted_";

/// Storage behind an [`Acceptor`](super::Acceptor).
///
/// Implementations must make every write durable before returning `Ok`.
pub trait ProposalLog: Send + Sync {
    /// Highest round this node promised or accepted in (0 if none).
    fn promised(&self, ns: LogNamespace) -> Result<Round>;

    fn accepted(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>>;

    fn highest_accepted_below(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>>;

    fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>>;

    fn record_promise(&self, ns: LogNamespace, round: Round) -> Result<()>;

    /// Record `proposal` as accepted and raise the promised round to its round
    /// if lower, in one atomic write.
    fn record_accept(&self, ns: LogNamespace, proposal: &Proposal) -> Result<()>;
}

/// redb-backed proposal log.
pub struct RedbProposalLog {
    store: RedbStore,
    promised: RedbTree,
    accepted: HashMap<LogNamespace, RedbTree>,
}

impl RedbProposalLog {
    /// Open (or create) the log at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_store(RedbStore::open(path)?)
    }

    pub fn with_store(store: RedbStore) -> Result<Self> {
        let promised = store.tree(PROMISED_TREE)?;
        let mut accepted = HashMap::new();
        for ns in LogNamespace::ALL {
            let name = format!("{}{}", ACCEPTED_TREE_PREFIX, ns.as_str());
            accepted.insert(ns, store.tree(&name)?);
        }
        Ok(Self {
            store,
            promised,
            accepted,
        })
    }

    fn accepted_tree(&self, ns: LogNamespace) -> Result<&RedbTree> {
        self.accepted
            .get(&ns)
            .ok_or_else(|| StorageError::NotInitialized(format!("no tree for {}", ns.as_str())))
    }

    fn decode_entry(entry: Option<(Vec<u8>, Vec<u8>)>) -> Result<Option<Proposal>> {
        match entry {
            Some((_, bytes)) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl ProposalLog for RedbProposalLog {
    fn promised(&self, ns: LogNamespace) -> Result<Round> {
        Ok(self
            .promised
            .get_bincode::<Round>(ns.as_str().as_bytes())?
            .unwrap_or(0))
    }

    fn accepted(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        self.accepted_tree(ns)?.get_bincode(&round.to_be_bytes())
    }

    fn highest_accepted_below(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        Self::decode_entry(self.accepted_tree(ns)?.last_below(&round.to_be_bytes())?)
    }

    fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>> {
        Self::decode_entry(self.accepted_tree(ns)?.last()?)
    }

    fn record_promise(&self, ns: LogNamespace, round: Round) -> Result<()> {
        self.promised
            .set_bincode(ns.as_str().as_bytes(), &round)
    }

    fn record_accept(&self, ns: LogNamespace, proposal: &Proposal) -> Result<()> {
        let promised = self.promised(ns)?.max(proposal.round);
        let mut batch = self.store.batch();
        batch.insert(
            self.accepted_tree(ns)?,
            &proposal.round.to_be_bytes(),
            &bincode::serialize(proposal)?,
        );
        batch.insert(
            &self.promised,
            ns.as_str().as_bytes(),
            &bincode::serialize(&promised)?,
        );
        batch.apply()
    }
}

#[derive(Default)]
struct MemoryNamespace {
    promised: Round,
    accepted: BTreeMap<Round, Proposal>,
}

/// Volatile proposal log for tests and single-process clusters.
///
/// `set_unavailable(true)` makes every operation fail, which simulates a
/// disk or backing-store outage.
#[derive(Default)]
pub struct InMemoryProposalLog {
    logs: Mutex<HashMap<LogNamespace, MemoryNamespace>>,
    unavailable: AtomicBool,
}

impl InMemoryProposalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "proposal log unavailable",
            )));
        }
        Ok(())
    }
}

impl ProposalLog for InMemoryProposalLog {
    fn promised(&self, ns: LogNamespace) -> Result<Round> {
        self.check()?;
        Ok(self.logs.lock().get(&ns).map_or(0, |l| l.promised))
    }

    fn accepted(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        self.check()?;
        Ok(self
            .logs
            .lock()
            .get(&ns)
            .and_then(|l| l.accepted.get(&round).cloned()))
    }

    fn highest_accepted_below(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        self.check()?;
        Ok(self
            .logs
            .lock()
            .get(&ns)
            .and_then(|l| l.accepted.range(..round).next_back().map(|(_, p)| p.clone())))
    }

    fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>> {
        self.check()?;
        Ok(self
            .logs
            .lock()
            .get(&ns)
            .and_then(|l| l.accepted.values().next_back().cloned()))
    }

    fn record_promise(&self, ns: LogNamespace, round: Round) -> Result<()> {
        self.check()?;
        self.logs.lock().entry(ns).or_default().promised = round;
        Ok(())
    }

    fn record_accept(&self, ns: LogNamespace, proposal: &Proposal) -> Result<()> {
        self.check()?;
        let mut logs = self.logs.lock();
        let log = logs.entry(ns).or_default();
        log.promised = log.promised.max(proposal.round);
        log.accepted.insert(proposal.round, proposal.clone());
        Ok(())
    }
}

/// A proposal log whose backing store is installed after boot.
///
/// Until [`install`](Self::install) succeeds every call fails with
/// [`StorageError::NotInitialized`], so an acceptor built on it rejects
/// rounds rather than acknowledging them without durability.
#[derive(Default)]
pub struct DeferredProposalLog {
    inner: OnceLock<Arc<dyn ProposalLog>>,
}

impl DeferredProposalLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the backing log. Returns `false` if one was already installed.
    pub fn install(&self, log: Arc<dyn ProposalLog>) -> bool {
        self.inner.set(log).is_ok()
    }

    pub fn is_installed(&self) -> bool {
        self.inner.get().is_some()
    }

    fn get(&self) -> Result<&Arc<dyn ProposalLog>> {
        self.inner
            .get()
            .ok_or_else(|| StorageError::NotInitialized("proposal log not installed".into()))
    }
}

impl ProposalLog for DeferredProposalLog {
    fn promised(&self, ns: LogNamespace) -> Result<Round> {
        self.get()?.promised(ns)
    }

    fn accepted(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        self.get()?.accepted(ns, round)
    }

    fn highest_accepted_below(&self, ns: LogNamespace, round: Round) -> Result<Option<Proposal>> {
        self.get()?.highest_accepted_below(ns, round)
    }

    fn highest_accepted(&self, ns: LogNamespace) -> Result<Option<Proposal>> {
        self.get()?.highest_accepted(ns)
    }

    fn record_promise(&self, ns: LogNamespace, round: Round) -> Result<()> {
        self.get()?.record_promise(ns, round)
    }

    fn record_accept(&self, ns: LogNamespace, proposal: &Proposal) -> Result<()> {
        self.get()?.record_accept(ns, proposal)
    }
}
