use futures::StreamExt;
use futures::stream::{BoxStream, Stream};

use super::{ItemStream, MaybePending, PendingHandle, Stage};

/// Pairs every item with the next item of another stream.
///
/// Ends as soon as either side ends. A pair is pending whenever either side is.
pub struct Zip<B> {
    other: ItemStream<B>,
}

impl<B: Send + 'static> Zip<B> {
    pub fn new<S>(other: S) -> Self
    where
        S: Stream<Item = B> + Send + 'static,
    {
        Self {
            other: other.map(MaybePending::Ready).boxed(),
        }
    }

    pub fn with_pending(other: BoxStream<'static, MaybePending<B>>) -> Self {
        Self { other }
    }
}

impl<A, B> Stage<A> for Zip<B>
where
    A: Send + 'static,
    B: Send + 'static,
{
    type Out = (A, B);

    fn apply(self, input: ItemStream<A>) -> ItemStream<(A, B)> {
        input
            .zip(self.other)
            .map(|pair| match pair {
                (MaybePending::Ready(a), MaybePending::Ready(b)) => MaybePending::Ready((a, b)),
                (a, b) => MaybePending::Pending(PendingHandle::spawn(async move {
                    futures::try_join!(a.resolve(), b.resolve())
                })),
            })
            .boxed()
    }
}
