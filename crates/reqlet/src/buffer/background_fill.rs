use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Buffer, BufferError, BufferItem};
use crate::permit::PermitSource;

/// Produces one item per call. Retrying is the producer's own business.
pub type FillFn<T> = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<T>> + Send + Sync>;

/// Invoked after a filled item has been stored.
pub type AddedFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

/// Buffer decorator filled by a fixed pool of background workers.
///
/// Workers only produce while permits are available, so nothing is fetched
/// until [`request`](Self::request) is called.
pub struct BackgroundFillBuffer<T, B> {
    buffer: Arc<B>,
    fill: FillFn<T>,
    concurrency: usize,
    on_added: Option<AddedFn<T>>,
    permits: Arc<PermitSource>,
    workers: Mutex<Option<Vec<JoinHandle<()>>>>,
}

impl<T: BufferItem, B: Buffer<T> + 'static> BackgroundFillBuffer<T, B> {
    pub fn new(buffer: B, fill: FillFn<T>, concurrency: usize) -> Self {
        Self {
            buffer: Arc::new(buffer),
            fill,
            concurrency: concurrency.max(1),
            on_added: None,
            permits: Arc::new(PermitSource::new(0)),
            workers: Mutex::new(None),
        }
    }

    pub fn with_on_added(mut self, on_added: AddedFn<T>) -> Self {
        self.on_added = Some(on_added);
        self
    }

    pub async fn start(&self) -> Result<(), BufferError> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(BufferError::AlreadyStarted);
        }

        let handles = (0..self.concurrency)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&self.buffer),
                    Arc::clone(&self.fill),
                    Arc::clone(&self.permits),
                    self.on_added.clone(),
                ))
            })
            .collect();
        *workers = Some(handles);

        tracing::debug!(target: "reqlet::buffer", workers = self.concurrency, "Background fill started");
        Ok(())
    }

    /// Cancel and join every worker, then drop outstanding requests.
    pub async fn stop(&self) -> Result<(), BufferError> {
        let mut workers = self.workers.lock().await;
        let Some(handles) = workers.take() else {
            return Err(BufferError::AlreadyStopped);
        };

        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            match handle.await {
                Err(e) if !e.is_cancelled() => {
                    tracing::error!(target: "reqlet::buffer", error = %e, "Fill worker panicked");
                }
                _ => {}
            }
        }
        self.permits.reset();

        tracing::debug!(target: "reqlet::buffer", "Background fill stopped");
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.workers.lock().await.is_some()
    }

    /// Ask the workers for `count` more items.
    pub fn request(&self, count: usize) {
        self.permits.increase(count);
    }

    /// Stored items plus items requested but not yet stored.
    pub fn size_with_requested(&self) -> usize {
        self.buffer.size() + self.permits.count_with_pending()
    }

    /// Wait up to `deadline` for every request to be picked up, then drain the buffer.
    pub async fn get_all_requested(&self, deadline: Duration) -> Vec<T> {
        if !self.permits.is_drained()
            && tokio::time::timeout(deadline, self.permits.wait_drained())
                .await
                .is_err()
        {
            tracing::debug!(
                target: "reqlet::buffer",
                outstanding = self.permits.count(),
                "Deadline reached before all requests were picked up"
            );
        }
        self.buffer.get_all().await
    }
}

async fn worker_loop<T: BufferItem, B: Buffer<T>>(
    worker_id: usize,
    buffer: Arc<B>,
    fill: FillFn<T>,
    permits: Arc<PermitSource>,
    on_added: Option<AddedFn<T>>,
) {
    loop {
        let permit = permits.acquire_owned().await;
        tracing::trace!(target: "reqlet::buffer", worker_id, "Filling item");

        let item = match fill().await {
            Ok(item) => item,
            Err(e) => {
                tracing::error!(
                    target: "reqlet::buffer",
                    worker_id,
                    error = %format!("{e:#}"),
                    "Fill function failed, stopping worker"
                );
                buffer.set_error(BufferError::Failed(format!("{e:#}")));
                drop(permit);
                return;
            }
        };

        buffer.put(item.clone()).await;
        drop(permit);

        if let Some(on_added) = &on_added {
            on_added(item).await;
        }
        tracing::trace!(target: "reqlet::buffer", worker_id, size = buffer.size(), "Item added");
    }
}

#[async_trait]
impl<T: BufferItem, B: Buffer<T> + 'static> Buffer<T> for BackgroundFillBuffer<T, B> {
    fn size(&self) -> usize {
        self.buffer.size()
    }

    async fn wait_for_any_items(&self) {
        self.buffer.wait_for_any_items().await
    }

    async fn get(&self) -> Result<T, BufferError> {
        self.buffer.get().await
    }

    fn try_get(&self) -> Result<Option<T>, BufferError> {
        self.buffer.try_get()
    }

    async fn get_all(&self) -> Vec<T> {
        self.buffer.get_all().await
    }

    async fn put(&self, item: T) {
        self.buffer.put(item).await
    }

    async fn put_all(&self, items: Vec<T>) {
        self.buffer.put_all(items).await
    }

    async fn remove(&self, item: &T) -> Result<(), BufferError> {
        self.buffer.remove(item).await
    }

    fn set_error(&self, error: BufferError) {
        self.buffer.set_error(error)
    }

    fn reset_error(&self) {
        self.buffer.reset_error()
    }
}
