//! Single-use counting semaphore with exposed counters and a drained signal.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use tokio::sync::{Notify, watch};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PermitError {
    #[error("Permit released more times than acquired")]
    OverReleased,
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    grant: usize,
    pending: usize,
}

pub struct PermitSource {
    counts: StdMutex<Counts>,
    available: Notify,
    drained_tx: watch::Sender<bool>,
}

impl PermitSource {
    pub fn new(initial: usize) -> Self {
        let (drained_tx, _) = watch::channel(initial == 0);
        Self {
            counts: StdMutex::new(Counts {
                grant: initial,
                pending: 0,
            }),
            available: Notify::new(),
            drained_tx,
        }
    }

    fn counts(&self) -> MutexGuard<'_, Counts> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::permit", "Permit counters poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Must be called with the counters locked so the signal never lags the counts.
    fn publish(&self, counts: &Counts) {
        let drained = counts.grant == 0;
        self.drained_tx.send_if_modified(|current| {
            if *current == drained {
                return false;
            }
            *current = drained;
            true
        });
    }

    /// Wait until a permit is granted, then move it to pending.
    ///
    /// Cancel-safe: a dropped future never consumes a permit.
    pub async fn acquire(&self) {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_acquire() {
                return;
            }

            notified.await;
        }
    }

    /// Acquire a permit that releases itself on drop.
    pub async fn acquire_owned(self: &Arc<Self>) -> PermitGuard {
        self.acquire().await;
        PermitGuard {
            source: Arc::clone(self),
            released: false,
        }
    }

    pub fn try_acquire(&self) -> bool {
        let mut counts = self.counts();
        if counts.grant == 0 {
            return false;
        }
        counts.grant -= 1;
        counts.pending += 1;
        self.publish(&counts);
        true
    }

    pub fn release(&self) -> Result<(), PermitError> {
        let mut counts = self.counts();
        if counts.pending == 0 {
            tracing::error!(target: "reqlet::permit", "Release called without a matching acquire");
            return Err(PermitError::OverReleased);
        }
        counts.pending -= 1;
        self.publish(&counts);
        Ok(())
    }

    /// Add `n` grants and wake blocked acquirers.
    pub fn increase(&self, n: usize) {
        if n == 0 {
            return;
        }
        {
            let mut counts = self.counts();
            counts.grant += n;
            self.publish(&counts);
        }
        self.available.notify_waiters();
    }

    /// Zero both counters and re-assert the drained signal.
    pub fn reset(&self) {
        let mut counts = self.counts();
        *counts = Counts::default();
        self.publish(&counts);
    }

    pub fn count(&self) -> usize {
        self.counts().grant
    }

    pub fn pending_count(&self) -> usize {
        self.counts().pending
    }

    pub fn count_with_pending(&self) -> usize {
        let counts = self.counts();
        counts.grant + counts.pending
    }

    pub fn is_drained(&self) -> bool {
        *self.drained_tx.borrow()
    }

    /// Resolve once no grants remain.
    pub async fn wait_drained(&self) {
        let mut rx = self.drained_tx.subscribe();
        // The sender lives as long as `self`, so this can only resolve via the predicate.
        let _ = rx.wait_for(|drained| *drained).await;
    }
}

impl Default for PermitSource {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for PermitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts = *self.counts();
        f.debug_struct("PermitSource")
            .field("grant", &counts.grant)
            .field("pending", &counts.pending)
            .finish()
    }
}

/// An acquired permit. Releases back to its source on drop.
#[must_use = "dropping the guard releases the permit immediately"]
pub struct PermitGuard {
    source: Arc<PermitSource>,
    released: bool,
}

impl PermitGuard {
    pub fn release(mut self) -> Result<(), PermitError> {
        self.released = true;
        self.source.release()
    }
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.source.release();
        }
    }
}
