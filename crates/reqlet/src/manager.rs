//! Lifecycle contract shared by every manager plus the supply callbacks
//! managers are wired together with.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::BufferError;
use crate::event_bus::EventBusError;
use crate::resource::{Activity, Agreement, Proposal, ResourceError};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    #[error("{0} is already started")]
    AlreadyStarted(&'static str),
    #[error("{0} is not started")]
    NotStarted(&'static str),
    #[error("Proposal `{proposal_id}` rejected: {reason}")]
    Rejected { proposal_id: String, reason: String },
    #[error("No response to proposal `{0}` before the stream closed")]
    StreamClosed(String),
    #[error("Agreement `{0}` was not approved")]
    NotApproved(String),
    #[error("Upstream supply failed: {0}")]
    Supply(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    EventBus(#[from] EventBusError),
}

/// Start/stop contract. Starting twice or stopping a stopped manager is an error.
#[async_trait]
pub trait Manager: Send + Sync {
    async fn start(&self) -> Result<(), ManagerError>;

    async fn stop(&self) -> Result<(), ManagerError>;

    fn is_started(&self) -> bool;
}

pub type ProposalSource =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Proposal, ManagerError>> + Send + Sync>;

pub type AgreementSource =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Agreement, ManagerError>> + Send + Sync>;

pub type ActivitySource =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Activity, ManagerError>> + Send + Sync>;

/// One cancellable background task owned by a manager.
pub(crate) struct BackgroundLoop {
    name: &'static str,
    running: StdMutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl BackgroundLoop {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            running: StdMutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::manager", name = self.name, "Loop state poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Spawn `body` with a fresh token that is cancelled on [`stop`](Self::stop).
    pub fn start<F, Fut>(&self, body: F) -> Result<(), ManagerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running();
        if running.is_some() {
            return Err(ManagerError::AlreadyStarted(self.name));
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(body(token.clone()));
        *running = Some((token, handle));
        tracing::debug!(target: "reqlet::manager", name = self.name, "Background loop started");
        Ok(())
    }

    /// Cancel the task and wait for it to finish.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        let Some((token, handle)) = self.running().take() else {
            return Err(ManagerError::NotStarted(self.name));
        };
        token.cancel();
        match handle.await {
            Err(e) if e.is_panic() => {
                tracing::error!(target: "reqlet::manager", name = self.name, error = %e, "Background loop panicked");
            }
            _ => {}
        }
        tracing::debug!(target: "reqlet::manager", name = self.name, "Background loop stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.running().is_some()
    }
}

impl Drop for BackgroundLoop {
    fn drop(&mut self) {
        if let Some((token, handle)) = self.running().take() {
            token.cancel();
            handle.abort();
        }
    }
}

/// Plain start/stop flag for managers without a background task.
pub(crate) struct StartedFlag {
    name: &'static str,
    started: std::sync::atomic::AtomicBool,
}

impl StartedFlag {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            started: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn start(&self) -> Result<(), ManagerError> {
        use std::sync::atomic::Ordering;
        self.started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ManagerError::AlreadyStarted(self.name))
    }

    pub fn stop(&self) -> Result<(), ManagerError> {
        use std::sync::atomic::Ordering;
        self.started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ManagerError::NotStarted(self.name))
    }

    pub fn is_started(&self) -> bool {
        self.started.load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn background_loop_is_cancelled_and_joined_on_stop() {
        let background = BackgroundLoop::new("test loop");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);

        background
            .start(move |token: CancellationToken| async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            })
            .unwrap();
        assert!(background.is_started());
        assert_eq!(
            background.start(|_token: CancellationToken| async {}),
            Err(ManagerError::AlreadyStarted("test loop"))
        );

        background.stop().await.unwrap();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!background.is_started());
        assert_eq!(
            background.stop().await,
            Err(ManagerError::NotStarted("test loop"))
        );
    }

    #[test]
    fn started_flag_rejects_misuse() {
        let flag = StartedFlag::new("flag");
        assert_eq!(flag.stop(), Err(ManagerError::NotStarted("flag")));
        flag.start().unwrap();
        assert_eq!(flag.start(), Err(ManagerError::AlreadyStarted("flag")));
        assert!(flag.is_started());
        flag.stop().unwrap();
        assert!(!flag.is_started());
    }
}
