use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{Buffer, BufferError, BufferItem};

struct State<T> {
    items: VecDeque<T>,
    error: Option<BufferError>,
}

/// Plain FIFO buffer.
pub struct SimpleBuffer<T> {
    state: StdMutex<State<T>>,
    changed: Notify,
}

impl<T: BufferItem> SimpleBuffer<T> {
    pub fn new() -> Self {
        Self::with_items(Vec::new())
    }

    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            state: StdMutex::new(State {
                items: items.into(),
                error: None,
            }),
            changed: Notify::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::buffer", "Buffer state poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Clone of the stored items in withdrawal order.
    pub fn snapshot(&self) -> Vec<T> {
        self.state().items.iter().cloned().collect()
    }
}

impl<T: BufferItem> Default for SimpleBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: BufferItem> Buffer<T> for SimpleBuffer<T> {
    fn size(&self) -> usize {
        self.state().items.len()
    }

    async fn wait_for_any_items(&self) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state();
                if !state.items.is_empty() || state.error.is_some() {
                    return;
                }
            }

            notified.await;
        }
    }

    async fn get(&self) -> Result<T, BufferError> {
        loop {
            self.wait_for_any_items().await;
            if let Some(item) = self.try_get()? {
                return Ok(item);
            }
        }
    }

    fn try_get(&self) -> Result<Option<T>, BufferError> {
        let mut state = self.state();
        if let Some(item) = state.items.pop_front() {
            return Ok(Some(item));
        }
        match &state.error {
            Some(error) => Err(error.clone()),
            None => Ok(None),
        }
    }

    async fn get_all(&self) -> Vec<T> {
        self.state().items.drain(..).collect()
    }

    async fn put(&self, item: T) {
        self.state().items.push_back(item);
        self.changed.notify_waiters();
    }

    async fn put_all(&self, items: Vec<T>) {
        self.state().items = items.into();
        self.changed.notify_waiters();
    }

    async fn remove(&self, item: &T) -> Result<(), BufferError> {
        let mut state = self.state();
        let position = state
            .items
            .iter()
            .position(|stored| stored == item)
            .ok_or(BufferError::NotFound)?;
        state.items.remove(position);
        Ok(())
    }

    fn set_error(&self, error: BufferError) {
        self.state().error = Some(error);
        self.changed.notify_waiters();
    }

    fn reset_error(&self) {
        self.state().error = None;
    }
}
