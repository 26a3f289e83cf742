use futures::StreamExt;

use super::{ItemStream, Stage};

/// Forwards the first `max_items` items, then ends the stream.
#[derive(Debug, Clone, Copy)]
pub struct Limit {
    max_items: usize,
}

impl Limit {
    pub fn new(max_items: usize) -> Self {
        Self { max_items }
    }
}

impl<T: Send + 'static> Stage<T> for Limit {
    type Out = T;

    fn apply(self, input: ItemStream<T>) -> ItemStream<T> {
        input.take(self.max_items).boxed()
    }
}
