use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::{Buffer, BufferError, BufferItem};

/// Expiry delay for an item, or `None` for items that never expire.
pub type ExpirationFn<T> = Arc<dyn Fn(&T) -> Option<Duration> + Send + Sync>;

/// Invoked after an expired item has been removed from the buffer.
pub type ExpiredFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>;

struct TimerEntry<T> {
    id: u64,
    item: T,
    handle: AbortHandle,
}

struct Timers<T> {
    next_id: u64,
    entries: Vec<TimerEntry<T>>,
}

impl<T: PartialEq> Timers<T> {
    /// Cancel the oldest timer for `item`, matching arrival order for duplicates.
    fn cancel_first(&mut self, item: &T) {
        if let Some(position) = self.entries.iter().position(|entry| &entry.item == item) {
            self.entries.remove(position).handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        for entry in self.entries.drain(..) {
            entry.handle.abort();
        }
    }
}

struct Inner<T, B> {
    buffer: B,
    expiration: ExpirationFn<T>,
    on_expired: Option<ExpiredFn<T>>,
    // Held across every mutation so contents and timers never diverge.
    timers: Mutex<Timers<T>>,
    /// Cancelled when the owning buffer is dropped, ending every timer.
    dropped: CancellationToken,
}

impl<T: BufferItem, B: Buffer<T> + 'static> Inner<T, B> {
    fn schedule(self: &Arc<Self>, timers: &mut Timers<T>, item: T) {
        let Some(after) = (self.expiration)(&item) else {
            return;
        };

        let id = timers.next_id;
        timers.next_id += 1;

        let inner = Arc::clone(self);
        let expired = item.clone();
        let dropped = self.dropped.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = dropped.cancelled() => {}
                _ = tokio::time::sleep(after) => inner.expire(id, expired).await,
            }
        });

        timers.entries.push(TimerEntry {
            id,
            item,
            handle: task.abort_handle(),
        });
    }

    async fn expire(&self, id: u64, item: T) {
        {
            let mut timers = self.timers.lock().await;
            let Some(position) = timers.entries.iter().position(|entry| entry.id == id) else {
                return;
            };
            timers.entries.remove(position);

            if self.buffer.remove(&item).await.is_err() {
                tracing::debug!(target: "reqlet::buffer", timer_id = id, "Expired item already gone");
                return;
            }
        }

        tracing::debug!(target: "reqlet::buffer", timer_id = id, "Item expired");
        if let Some(on_expired) = &self.on_expired {
            on_expired(item).await;
        }
    }
}

/// Buffer decorator that removes items after a per-item delay.
///
/// Items already stored in the wrapped buffer when it is handed over never expire.
pub struct ExpirableBuffer<T, B> {
    inner: Arc<Inner<T, B>>,
}

impl<T: BufferItem, B: Buffer<T> + 'static> ExpirableBuffer<T, B> {
    pub fn new(buffer: B, expiration: ExpirationFn<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                buffer,
                expiration,
                on_expired: None,
                timers: Mutex::new(Timers {
                    next_id: 0,
                    entries: Vec::new(),
                }),
                dropped: CancellationToken::new(),
            }),
        }
    }

    /// Set the expiry callback. Must be called before the buffer is shared.
    pub fn with_on_expired(mut self, on_expired: ExpiredFn<T>) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.on_expired = Some(on_expired),
            None => {
                debug_assert!(false, "expiry callback set after the buffer was shared");
                tracing::error!(target: "reqlet::buffer", "Cannot set expiry callback on a shared buffer");
            }
        }
        self
    }

    /// Number of live expiry timers.
    pub async fn pending_timers(&self) -> usize {
        self.inner.timers.lock().await.entries.len()
    }
}

impl<T, B> Drop for ExpirableBuffer<T, B> {
    fn drop(&mut self) {
        // Timers still hold the inner state, so they are told to stop
        // instead of relying on the lock being free.
        self.inner.dropped.cancel();
        if let Ok(mut timers) = self.inner.timers.try_lock() {
            for entry in timers.entries.drain(..) {
                entry.handle.abort();
            }
        }
    }
}

#[async_trait]
impl<T: BufferItem, B: Buffer<T> + 'static> Buffer<T> for ExpirableBuffer<T, B> {
    fn size(&self) -> usize {
        self.inner.buffer.size()
    }

    async fn wait_for_any_items(&self) {
        self.inner.buffer.wait_for_any_items().await
    }

    async fn get(&self) -> Result<T, BufferError> {
        loop {
            self.inner.buffer.wait_for_any_items().await;

            let mut timers = self.inner.timers.lock().await;
            if let Some(item) = self.inner.buffer.try_get()? {
                timers.cancel_first(&item);
                return Ok(item);
            }
        }
    }

    /// Non-blocking: while another operation or an expiry holds the timer
    /// table, the buffer reads as empty and the caller should wait with
    /// [`wait_for_any_items`](Buffer::wait_for_any_items) or [`get`](Buffer::get).
    fn try_get(&self) -> Result<Option<T>, BufferError> {
        let Ok(mut timers) = self.inner.timers.try_lock() else {
            return Ok(None);
        };
        let item = self.inner.buffer.try_get()?;
        if let Some(item) = &item {
            timers.cancel_first(item);
        }
        Ok(item)
    }

    async fn get_all(&self) -> Vec<T> {
        let mut timers = self.inner.timers.lock().await;
        let items = self.inner.buffer.get_all().await;
        timers.cancel_all();
        items
    }

    async fn put(&self, item: T) {
        let mut timers = self.inner.timers.lock().await;
        self.inner.buffer.put(item.clone()).await;
        self.inner.schedule(&mut timers, item);
    }

    async fn put_all(&self, items: Vec<T>) {
        let mut timers = self.inner.timers.lock().await;
        self.inner.buffer.put_all(items.clone()).await;
        timers.cancel_all();
        for item in items {
            self.inner.schedule(&mut timers, item);
        }
    }

    async fn remove(&self, item: &T) -> Result<(), BufferError> {
        let mut timers = self.inner.timers.lock().await;
        self.inner.buffer.remove(item).await?;
        timers.cancel_first(item);
        Ok(())
    }

    fn set_error(&self, error: BufferError) {
        self.inner.buffer.set_error(error)
    }

    fn reset_error(&self) {
        self.inner.buffer.reset_error()
    }
}
