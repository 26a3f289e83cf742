use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream;
use tokio::sync::Mutex;

use super::{ItemStream, MaybePending, PendingHandle, PipelineError, Stage};

pub type MapFn<In, Out> = Arc<dyn Fn(In) -> BoxFuture<'static, anyhow::Result<Out>> + Send + Sync>;

type SharedUpstream<In> = Arc<Mutex<ItemStream<In>>>;

/// Applies an async function to every item.
///
/// When the function fails for an item, that item is dropped and the next
/// upstream item is tried instead.
///
/// With deferred completion (the default) every upstream item is turned into
/// a [`PendingHandle`] immediately, so downstream stages can run many
/// computations at once. Without it, results are produced one at a time in
/// upstream order.
pub struct Map<In, Out> {
    func: MapFn<In, Out>,
    defer_completion: bool,
}

impl<In, Out> Map<In, Out> {
    pub fn new(func: MapFn<In, Out>) -> Self {
        Self {
            func,
            defer_completion: true,
        }
    }

    pub fn with_defer_completion(mut self, defer_completion: bool) -> Self {
        self.defer_completion = defer_completion;
        self
    }
}

impl<In, Out> Stage<In> for Map<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Out = Out;

    fn apply(self, input: ItemStream<In>) -> ItemStream<Out> {
        let upstream: SharedUpstream<In> = Arc::new(Mutex::new(input));
        let func = self.func;

        if self.defer_completion {
            stream::unfold((upstream, func), |(upstream, func)| async move {
                let item = next_item(&upstream).await?;
                let handle = PendingHandle::spawn(apply_until_success(
                    item,
                    Arc::clone(&upstream),
                    Arc::clone(&func),
                ));
                Some((MaybePending::Pending(handle), (upstream, func)))
            })
            .boxed()
        } else {
            stream::unfold((upstream, func), |(upstream, func)| async move {
                loop {
                    let item = next_item(&upstream).await?;
                    match apply_until_success(item, Arc::clone(&upstream), Arc::clone(&func)).await {
                        Ok(value) => return Some((MaybePending::Ready(value), (upstream, func))),
                        Err(PipelineError::InputExhausted) => return None,
                        Err(e) => {
                            tracing::warn!(target: "reqlet::pipeline", error = %e, "Dropping unresolved item");
                        }
                    }
                }
            })
            .boxed()
        }
    }
}

async fn next_item<In>(upstream: &SharedUpstream<In>) -> Option<MaybePending<In>> {
    upstream.lock().await.next().await
}

async fn apply_until_success<In, Out>(
    first: MaybePending<In>,
    upstream: SharedUpstream<In>,
    func: MapFn<In, Out>,
) -> Result<Out, PipelineError>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    let mut item = first;
    loop {
        let value = item.resolve().await?;
        match func(value).await {
            Ok(out) => return Ok(out),
            Err(e) => {
                tracing::warn!(
                    target: "reqlet::pipeline",
                    error = %format!("{e:#}"),
                    "Map function failed, trying next item"
                );
            }
        }
        item = next_item(&upstream)
            .await
            .ok_or(PipelineError::InputExhausted)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn double() -> MapFn<u32, u32> {
        Arc::new(|x: u32| async move { Ok::<u32, anyhow::Error>(x * 2) }.boxed())
    }

    fn source(items: Vec<u32>) -> ItemStream<u32> {
        stream::iter(items.into_iter().map(MaybePending::Ready)).boxed()
    }

    #[tokio::test]
    async fn immediate_mode_preserves_order() {
        let delayed: MapFn<u32, u32> = Arc::new(|x: u32| {
            async move {
                tokio::time::sleep(std::time::Duration::from_millis(u64::from(10 - x))).await;
                Ok::<u32, anyhow::Error>(x)
            }
            .boxed()
        });
        let out: Vec<u32> = Map::new(delayed)
            .with_defer_completion(false)
            .apply(source(vec![1, 2, 3, 4]))
            .then(MaybePending::resolve)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn deferred_mode_yields_one_handle_per_item() {
        let handles: Vec<_> = Map::new(double()).apply(source(vec![1, 2, 3])).collect().await;
        assert_eq!(handles.len(), 3);
        assert!(handles.iter().all(|h| !h.is_ready()));

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.resolve().await.unwrap());
        }
        assert_eq!(values, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn failing_item_is_replaced_by_next_upstream_item() {
        let reject_odd: MapFn<u32, u32> = Arc::new(|x: u32| {
            async move {
                if x % 2 == 1 {
                    anyhow::bail!("odd value {x}");
                }
                Ok(x)
            }
            .boxed()
        });
        let out: Vec<u32> = Map::new(reject_odd)
            .with_defer_completion(false)
            .apply(source(vec![1, 2, 3, 5, 6, 7]))
            .then(MaybePending::resolve)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![2, 6]);
    }

    #[tokio::test]
    async fn deferred_failure_reports_exhaustion() {
        let always_fail: MapFn<u32, u32> =
            Arc::new(|x: u32| async move { Err::<u32, _>(anyhow::anyhow!("no {x}")) }.boxed());
        let handles: Vec<_> = Map::new(always_fail).apply(source(vec![1])).collect().await;
        assert_eq!(handles.len(), 1);
        for handle in handles {
            assert_eq!(handle.resolve().await, Err(PipelineError::InputExhausted));
        }
    }

    #[tokio::test]
    async fn maps_stack_over_pending_values() {
        let first = Map::new(double()).apply(source(vec![1, 2]));
        let out: Vec<u32> = Map::new(double())
            .with_defer_completion(false)
            .apply(first)
            .then(MaybePending::resolve)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(out, vec![4, 8]);
    }
}
