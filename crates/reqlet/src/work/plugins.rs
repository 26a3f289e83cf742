use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Value, json};

use super::{DoWork, Work, WorkError, WorkPlugin, WorkResult};

/// Retry failed work up to `tries` more times.
///
/// The result carries `extras["retry"] = {"tries": <failures>, "errors": [...]}`.
pub fn retry(tries: usize) -> WorkPlugin {
    retrying(tries, None)
}

/// Like [`retry`], sleeping `initial`, then twice as long, and so on between attempts.
pub fn retry_with_backoff(tries: usize, initial: Duration) -> WorkPlugin {
    retrying(tries, Some(initial))
}

fn retrying(tries: usize, backoff: Option<Duration>) -> WorkPlugin {
    Arc::new(move |do_work: DoWork| -> DoWork {
        Arc::new(move |work: Work| {
            let do_work = Arc::clone(&do_work);
            async move {
                let mut failures = 0;
                let mut errors: Vec<Value> = Vec::new();
                let mut delay = backoff;
                let mut result = loop {
                    let result = do_work(work.clone()).await;
                    let Some(error) = result.error.as_ref().map(ToString::to_string) else {
                        break result;
                    };
                    failures += 1;
                    errors.push(Value::from(error.clone()));
                    if failures > tries {
                        break result;
                    }
                    tracing::info!(
                        target: "reqlet::work",
                        work_id = %work.id(),
                        work = %work.name(),
                        attempt = failures,
                        left = tries + 1 - failures,
                        error = %error,
                        "Work failed, retrying"
                    );
                    if let Some(wait) = delay {
                        tokio::time::sleep(wait).await;
                        delay = Some(wait.saturating_mul(2));
                    }
                };
                result
                    .extras
                    .insert("retry".into(), json!({"tries": failures, "errors": errors}));
                result
            }
            .boxed()
        })
    })
}

/// Run the work `size` times at once and keep the first success.
///
/// The remaining attempts are dropped as soon as one succeeds. When every
/// attempt fails, the last failure is returned.
pub fn redundancy_cancel_others_on_first_done(size: usize) -> WorkPlugin {
    let size = size.max(1);
    Arc::new(move |do_work: DoWork| -> DoWork {
        Arc::new(move |work: Work| {
            let do_work = Arc::clone(&do_work);
            async move {
                let mut attempts: FuturesUnordered<_> =
                    (0..size).map(|_| do_work(work.clone())).collect();
                let mut last = WorkResult::failure(WorkError::Cancelled);
                while let Some(result) = attempts.next().await {
                    if result.is_success() {
                        tracing::debug!(
                            target: "reqlet::work",
                            work = %work.name(),
                            cancelled = attempts.len(),
                            "First redundant attempt succeeded"
                        );
                        return result;
                    }
                    last = result;
                }
                last
            }
            .boxed()
        })
    })
}
