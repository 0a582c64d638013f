//! Lock table entries, requests and tokens.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Result;
use crate::paxos::Term;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    Exclusive,
    Shared,
}

/// A pending acquisition.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub lock_name: String,
    pub mode: LockMode,
    pub requester_id: Uuid,
    pub deadline: Instant,
}

/// Proof of a granted lock, fenced to the term that granted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub token_id: Uuid,
    pub lock_name: String,
    pub mode: LockMode,
    pub term: Term,
    /// Holder is reaped after this instant unless refreshed.
    pub expiry: Instant,
}

#[derive(Debug, Clone)]
pub(crate) struct HolderInfo {
    pub token_id: Uuid,
    pub mode: LockMode,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub(crate) struct Waiter {
    pub id: Uuid,
    pub mode: LockMode,
    pub grant: oneshot::Sender<Result<LockToken>>,
}

/// Holders and FIFO wait queue of one lock name.
#[derive(Debug, Default)]
pub(crate) struct LockEntry {
    pub holders: Vec<HolderInfo>,
    pub queue: VecDeque<Waiter>,
}

impl LockEntry {
    /// Whether `mode` is compatible with the current holders.
    pub fn compatible(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Exclusive => self.holders.is_empty(),
            LockMode::Shared => self.holders.iter().all(|h| h.mode == LockMode::Shared),
        }
    }

    /// Grantable without overtaking anyone already queued.
    pub fn can_acquire(&self, mode: LockMode) -> bool {
        self.queue.is_empty() && self.compatible(mode)
    }

    pub fn holder(&self, token_id: Uuid) -> Option<&HolderInfo> {
        self.holders.iter().find(|h| h.token_id == token_id)
    }

    pub fn add_holder(&mut self, holder: HolderInfo) {
        self.holders.push(holder);
    }

    pub fn remove_holder(&mut self, token_id: Uuid) -> bool {
        let len_before = self.holders.len();
        self.holders.retain(|h| h.token_id != token_id);
        self.holders.len() < len_before
    }

    /// Remove expired holders and return true if any were removed.
    pub fn remove_expired(&mut self, now: Instant) -> bool {
        let len_before = self.holders.len();
        self.holders.retain(|h| h.expires_at > now);
        self.holders.len() < len_before
    }

    pub fn extend_ttl(&mut self, token_id: Uuid, expires_at: Instant) -> bool {
        for holder in &mut self.holders {
            if holder.token_id == token_id {
                holder.expires_at = expires_at;
                return true;
            }
        }
        false
    }

    /// Remove a queued waiter. Returns false if it is no longer queued.
    pub fn remove_waiter(&mut self, id: Uuid) -> bool {
        let len_before = self.queue.len();
        self.queue.retain(|w| w.id != id);
        self.queue.len() < len_before
    }

    pub fn is_idle(&self) -> bool {
        self.holders.is_empty() && self.queue.is_empty()
    }
}
