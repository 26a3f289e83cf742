//! Composable stream stages for assembling acquisition pipelines.
//!
//! Items flowing between stages are [`MaybePending`]: either an already
//! resolved value or a handle to a computation running in its own task. A
//! stage that needs the value resolves it once at its boundary. [`Chain`]
//! applies stages left to right:
//!
//! ```ignore
//! let results = Chain::new(offers)
//!     .pipe(Map::new(negotiate))
//!     .pipe(Map::new(create_agreement))
//!     .pipe(Buffer::new(4));
//! ```

mod buffer;
mod chain;
mod limit;
mod map;
mod zip;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use tokio::task::JoinHandle;

pub use buffer::Buffer;
pub use chain::Chain;
pub use limit::Limit;
pub use map::{Map, MapFn};
pub use zip::Zip;

/// Stream type passed between stages.
pub type ItemStream<T> = BoxStream<'static, MaybePending<T>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// The upstream ended before a value could be produced.
    #[error("Input stream exhausted")]
    InputExhausted,
    #[error("Pending computation aborted: {0}")]
    Aborted(String),
    /// The upstream produced an error instead of a value.
    #[error("Upstream item failed: {0}")]
    Failed(String),
}

/// A computation running in its own task. Dropping the handle aborts it.
pub struct PendingHandle<T> {
    task: JoinHandle<Result<T, PipelineError>>,
}

impl<T: Send + 'static> PendingHandle<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<T, PipelineError>> + Send + 'static,
    {
        Self {
            task: tokio::spawn(future),
        }
    }
}

impl<T> PendingHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl<T> Future for PendingHandle<T> {
    type Output = Result<T, PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(PipelineError::Aborted(e.to_string()))),
        }
    }
}

impl<T> Drop for PendingHandle<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<T> std::fmt::Debug for PendingHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingHandle")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

#[derive(Debug)]
pub enum MaybePending<T> {
    Ready(T),
    Pending(PendingHandle<T>),
}

impl<T: Send + 'static> MaybePending<T> {
    pub async fn resolve(self) -> Result<T, PipelineError> {
        match self {
            MaybePending::Ready(value) => Ok(value),
            MaybePending::Pending(handle) => handle.await,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, MaybePending::Ready(_))
    }
}

impl<T> From<T> for MaybePending<T> {
    fn from(value: T) -> Self {
        MaybePending::Ready(value)
    }
}

/// One step of a [`Chain`].
pub trait Stage<In>: Send + 'static {
    type Out: Send + 'static;

    fn apply(self, input: ItemStream<In>) -> ItemStream<Self::Out>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_resolves_immediately() {
        assert_eq!(MaybePending::Ready(3).resolve().await, Ok(3));
    }

    #[tokio::test]
    async fn pending_resolves_to_task_output() {
        let handle = PendingHandle::spawn(async { Ok("done") });
        assert_eq!(MaybePending::Pending(handle).resolve().await, Ok("done"));
    }

    #[tokio::test]
    async fn panicking_task_reports_aborted() {
        let handle: PendingHandle<u8> = PendingHandle::spawn(async { panic!("boom") });
        assert!(matches!(handle.await, Err(PipelineError::Aborted(_))));
    }

    #[tokio::test]
    async fn dropping_handle_aborts_task() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handle: PendingHandle<()> = PendingHandle::spawn(async move {
            let _tx = tx;
            futures::future::pending::<()>().await;
            Ok(())
        });
        drop(handle);
        // The sender is dropped together with the aborted task.
        assert!(rx.await.is_err());
    }
}
