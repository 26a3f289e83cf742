//! Ordered item containers with blocking withdrawal and error injection.
//!
//! [`SimpleBuffer`] is the base FIFO. [`ExpirableBuffer`] and
//! [`BackgroundFillBuffer`] wrap any other buffer and add per-item expiry and
//! permit-driven background production respectively. Withdrawing from an
//! empty buffer that has an injected error returns that error; queued items
//! are always handed out first.

mod background_fill;
mod expirable;
mod simple;

use std::sync::Arc;

use async_trait::async_trait;

pub use background_fill::{AddedFn, BackgroundFillBuffer, FillFn};
pub use expirable::{ExpirableBuffer, ExpirationFn, ExpiredFn};
pub use simple::SimpleBuffer;

/// Anything that can be stored in a buffer. Equality is used by `remove`.
pub trait BufferItem: Clone + PartialEq + Send + Sync + 'static {}

impl<T: Clone + PartialEq + Send + Sync + 'static> BufferItem for T {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    #[error("Item not found in buffer")]
    NotFound,
    #[error("{0}")]
    Failed(String),
    #[error("Background fill already started")]
    AlreadyStarted,
    #[error("Background fill already stopped")]
    AlreadyStopped,
}

#[async_trait]
pub trait Buffer<T: BufferItem>: Send + Sync {
    /// Number of items currently stored.
    fn size(&self) -> usize;

    /// Resolve once at least one item is stored or an error is injected.
    async fn wait_for_any_items(&self);

    /// Wait for, remove and return the oldest item.
    async fn get(&self) -> Result<T, BufferError>;

    /// Remove and return the oldest item without waiting.
    fn try_get(&self) -> Result<Option<T>, BufferError>;

    /// Remove and return every stored item.
    async fn get_all(&self) -> Vec<T>;

    /// Append an item. Duplicates are allowed.
    async fn put(&self, item: T);

    /// Replace the stored items.
    async fn put_all(&self, items: Vec<T>);

    /// Remove the first occurrence of `item`.
    async fn remove(&self, item: &T) -> Result<(), BufferError>;

    fn set_error(&self, error: BufferError);

    fn reset_error(&self);
}

#[async_trait]
impl<T: BufferItem, B: Buffer<T> + ?Sized> Buffer<T> for Arc<B> {
    fn size(&self) -> usize {
        (**self).size()
    }

    async fn wait_for_any_items(&self) {
        (**self).wait_for_any_items().await
    }

    async fn get(&self) -> Result<T, BufferError> {
        (**self).get().await
    }

    fn try_get(&self) -> Result<Option<T>, BufferError> {
        (**self).try_get()
    }

    async fn get_all(&self) -> Vec<T> {
        (**self).get_all().await
    }

    async fn put(&self, item: T) {
        (**self).put(item).await
    }

    async fn put_all(&self, items: Vec<T>) {
        (**self).put_all(items).await
    }

    async fn remove(&self, item: &T) -> Result<(), BufferError> {
        (**self).remove(item).await
    }

    fn set_error(&self, error: BufferError) {
        (**self).set_error(error)
    }

    fn reset_error(&self) {
        (**self).reset_error()
    }
}
