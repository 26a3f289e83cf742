use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::{self, FuturesUnordered};

use super::{ItemStream, MaybePending, PipelineError, Stage};

/// Resolves up to `size` items concurrently and emits them as they complete.
///
/// Output order follows completion, not arrival. Items that fail to resolve
/// are dropped; an exhausted upstream computation stops further reads.
#[derive(Debug, Clone, Copy)]
pub struct Buffer {
    size: usize,
}

impl Buffer {
    pub fn new(size: usize) -> Self {
        Self { size: size.max(1) }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(1)
    }
}

struct State<T> {
    input: Option<ItemStream<T>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Result<T, PipelineError>>>,
}

async fn next_input<T>(input: &mut Option<ItemStream<T>>) -> Option<MaybePending<T>> {
    match input {
        Some(stream) => stream.next().await,
        None => None,
    }
}

impl<T: Send + 'static> Stage<T> for Buffer {
    type Out = T;

    fn apply(self, input: ItemStream<T>) -> ItemStream<T> {
        let size = self.size;
        let state = State {
            input: Some(input),
            in_flight: FuturesUnordered::new(),
        };

        stream::unfold(state, move |mut state| async move {
            loop {
                let can_pull = state.input.is_some() && state.in_flight.len() < size;
                if !can_pull && state.in_flight.is_empty() {
                    return None;
                }

                tokio::select! {
                    biased;
                    Some(result) = state.in_flight.next(), if !state.in_flight.is_empty() => {
                        match result {
                            Ok(value) => return Some((MaybePending::Ready(value), state)),
                            Err(PipelineError::InputExhausted) => {
                                tracing::trace!(target: "reqlet::pipeline", "Upstream exhausted");
                                state.input = None;
                            }
                            Err(e) => {
                                tracing::warn!(target: "reqlet::pipeline", error = %e, "Dropping failed item");
                            }
                        }
                    }
                    item = next_input(&mut state.input), if can_pull => {
                        match item {
                            Some(item) => state.in_flight.push(Box::pin(item.resolve())),
                            None => state.input = None,
                        }
                    }
                    else => return None,
                }
            }
        })
        .boxed()
    }
}
