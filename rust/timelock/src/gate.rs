//! Process-wide readiness gate and the background initializer that opens it.
//!
//! A node boots and accepts connections before its proposal log is reachable.
//! Until the initializer succeeds, every timestamp and lock entry point fails
//! fast with [`TimelockError::NotInitialized`]. The gate opens exactly once;
//! later storage outages surface as `StorageFailure` from the acceptor, never
//! as a return to not-ready.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{Result, TimelockError};

/// Base backoff between initialization attempts.
pub const INIT_BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Default cap for the initialization backoff.
pub const INIT_BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    NotReady,
    Ready,
}

/// One-shot NotReady -> Ready latch.
pub struct AvailabilityGate {
    ready: watch::Sender<bool>,
    last_failure: Mutex<Option<String>>,
}

impl Default for AvailabilityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl AvailabilityGate {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            ready,
            last_failure: Mutex::new(None),
        }
    }

    /// A gate that starts open, for deployments with nothing to wait for.
    pub fn ready() -> Self {
        let gate = Self::new();
        gate.mark_ready();
        gate
    }

    pub fn state(&self) -> ReadinessState {
        if self.is_ready() {
            ReadinessState::Ready
        } else {
            ReadinessState::NotReady
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Open the gate. Returns `true` only for the call that flipped it.
    pub fn mark_ready(&self) -> bool {
        let flipped = self.ready.send_if_modified(|ready| {
            if *ready {
                return false;
            }
            *ready = true;
            true
        });
        if flipped {
            self.last_failure.lock().take();
            tracing::info!("timelock store initialized, serving requests");
        }
        flipped
    }

    /// Remember why initialization last failed, for `NotInitialized` errors.
    pub fn record_failure(&self, reason: impl Into<String>) {
        *self.last_failure.lock() = Some(reason.into());
    }

    fn not_initialized(&self) -> TimelockError {
        TimelockError::NotInitialized {
            reason: self
                .last_failure
                .lock()
                .clone()
                .unwrap_or_else(|| "store initialization in progress".to_string()),
        }
    }

    /// Fail fast unless the gate is open.
    pub fn check(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(self.not_initialized())
        }
    }

    /// Wait until the gate opens or `deadline` passes.
    pub async fn await_ready_or_error(&self, deadline: Instant) -> Result<()> {
        let mut ready = self.ready.subscribe();
        let opened = matches!(
            tokio::time::timeout_at(deadline, ready.wait_for(|r| *r)).await,
            Ok(Ok(_))
        );
        if opened {
            Ok(())
        } else {
            Err(self.not_initialized())
        }
    }
}

/// Retries an initialization routine with exponential backoff until it
/// succeeds, then opens the gate.
pub struct AsyncInitializer {
    name: String,
    backoff_cap: Duration,
}

impl AsyncInitializer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff_cap: INIT_BACKOFF_CAP,
        }
    }

    pub fn with_backoff_cap(mut self, cap: Duration) -> Self {
        self.backoff_cap = cap.max(INIT_BACKOFF_BASE);
        self
    }

    /// Run `init` until it returns `Ok`, then open `gate`.
    ///
    /// Returns `false` if `shutdown` fired first.
    pub async fn run<F, Fut>(
        self,
        gate: &AvailabilityGate,
        mut init: F,
        mut shutdown: watch::Receiver<bool>,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut backoff = INIT_BACKOFF_BASE;
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return false;
            }
            attempt += 1;
            match init().await {
                Ok(()) => {
                    tracing::info!(name = %self.name, attempt, "initialization succeeded");
                    gate.mark_ready();
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        name = %self.name,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "initialization failed: {}",
                        e
                    );
                    gate.record_failure(e.to_string());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
            backoff = (backoff * 2).min(self.backoff_cap);
        }
    }
}
