use std::pin::Pin;
use std::task::{Context, Poll};

use futures::StreamExt;
use futures::stream::Stream;

use super::{ItemStream, MaybePending, PipelineError, Stage};

/// A source stream with stages applied left to right.
pub struct Chain<T> {
    stream: ItemStream<T>,
}

impl<T: Send + 'static> Chain<T> {
    pub fn new<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        Self {
            stream: source.map(MaybePending::Ready).boxed(),
        }
    }

    pub fn from_items(source: ItemStream<T>) -> Self {
        Self { stream: source }
    }

    pub fn pipe<S: Stage<T>>(self, stage: S) -> Chain<S::Out> {
        Chain {
            stream: stage.apply(self.stream),
        }
    }

    /// Resolve every item in order, dropping those whose upstream ran dry.
    pub fn resolved(self) -> impl Stream<Item = Result<T, PipelineError>> + Send + 'static {
        self.stream
            .then(MaybePending::resolve)
            .filter(|result| {
                futures::future::ready(!matches!(result, Err(PipelineError::InputExhausted)))
            })
    }

    pub fn into_stream(self) -> ItemStream<T> {
        self.stream
    }
}

impl<T> Stream for Chain<T> {
    type Item = MaybePending<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.poll_next_unpin(cx)
    }
}
