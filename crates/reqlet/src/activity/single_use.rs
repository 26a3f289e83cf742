use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use super::{
    ActivityHook, create_activity, default_on_activity_start, default_on_activity_stop,
    release_activity, release_agreement, start_activity,
};
use crate::manager::{AgreementSource, Manager, ManagerError, StartedFlag};
use crate::resource::{Activity, Agreement};
use crate::work::{DoWork, Work, WorkContext, WorkResult};

/// Runs every work item on a fresh activity.
///
/// For each call: take an agreement, create an activity and run the start
/// hook, run the work, run the stop hook, then release the agreement. When
/// the activity cannot be created or started, the agreement is released and
/// the next one is tried. A cancelled call still releases what it holds.
pub struct SingleUseActivityManager {
    agreement_source: AgreementSource,
    on_activity_start: Option<ActivityHook>,
    on_activity_stop: Option<ActivityHook>,
    started: StartedFlag,
}

impl SingleUseActivityManager {
    pub fn new(agreement_source: AgreementSource) -> Self {
        Self {
            agreement_source,
            on_activity_start: Some(default_on_activity_start()),
            on_activity_stop: Some(default_on_activity_stop()),
            started: StartedFlag::new("single use activity manager"),
        }
    }

    /// Replace the hook run after creation. `None` leaves the activity as created.
    pub fn with_on_activity_start(mut self, hook: Option<ActivityHook>) -> Self {
        self.on_activity_start = hook;
        self
    }

    /// Replace the hook run after the work. It should destroy the activity.
    pub fn with_on_activity_stop(mut self, hook: Option<ActivityHook>) -> Self {
        self.on_activity_stop = hook;
        self
    }

    pub async fn do_work(&self, work: Work) -> WorkResult {
        if !self.started.is_started() {
            return WorkResult::failure(ManagerError::NotStarted("single use activity manager").into());
        }
        loop {
            let agreement = match (self.agreement_source)().await {
                Ok(agreement) => agreement,
                Err(e) => {
                    tracing::warn!(target: "reqlet::activity", work = %work.name(), error = %e, "No agreement for work");
                    return WorkResult::failure(e.into());
                }
            };
            let mut lease = Lease::new(agreement, self.on_activity_stop.clone());
            let prepared = match create_activity(&lease.agreement).await {
                Ok(activity) => {
                    lease.activity = Some(activity.clone());
                    start_activity(&activity, self.on_activity_start.as_ref())
                        .await
                        .map(|()| activity)
                }
                Err(e) => Err(e),
            };
            let activity = match prepared {
                Ok(activity) => activity,
                Err(e) => {
                    tracing::warn!(target: "reqlet::activity", agreement_id = %lease.agreement.id(), error = %e, "Creating activity failed, retrying with a new agreement");
                    // A failed start already destroyed the activity.
                    lease.activity = None;
                    lease.release().await;
                    continue;
                }
            };

            let result = work.call(WorkContext::new(activity)).await;
            lease.release().await;
            return result;
        }
    }

    /// [`do_work`](Self::do_work) as a base call for work managers.
    pub fn do_work_fn(self: &Arc<Self>) -> DoWork {
        let manager = Arc::clone(self);
        Arc::new(move |work: Work| {
            let manager = Arc::clone(&manager);
            async move { manager.do_work(work).await }.boxed()
        })
    }
}

/// The agreement and activity held by one work call.
///
/// A lease dropped without [`release`](Lease::release), as happens when the
/// call is cancelled, releases its resources on a spawned task.
struct Lease {
    agreement: Agreement,
    activity: Option<Activity>,
    on_stop: Option<ActivityHook>,
    released: bool,
}

impl Lease {
    fn new(agreement: Agreement, on_stop: Option<ActivityHook>) -> Self {
        Self {
            agreement,
            activity: None,
            on_stop,
            released: false,
        }
    }

    async fn release(mut self) {
        self.released = true;
        let activity = self.activity.take();
        let on_stop = self.on_stop.take();
        end_lease(self.agreement.clone(), activity, on_stop).await;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let cleanup = end_lease(self.agreement.clone(), self.activity.take(), self.on_stop.take());
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::info!(target: "reqlet::activity", agreement_id = %self.agreement.id(), "Work cancelled, releasing its lease in the background");
                handle.spawn(cleanup);
            }
            Err(_) => {
                tracing::warn!(target: "reqlet::activity", agreement_id = %self.agreement.id(), "Work cancelled outside a runtime, agreement left unreleased");
            }
        }
    }
}

async fn end_lease(agreement: Agreement, activity: Option<Activity>, on_stop: Option<ActivityHook>) {
    if let Some(activity) = activity {
        release_activity(&activity, on_stop.as_ref()).await;
    }
    release_agreement(&agreement).await;
}

#[async_trait]
impl Manager for SingleUseActivityManager {
    async fn start(&self) -> Result<(), ManagerError> {
        self.started.start()
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.started.stop()
    }

    fn is_started(&self) -> bool {
        self.started.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::agreements;
    use crate::session::Session;
    use crate::testing::{FakeMarket, settle};
    use crate::work::{WorkError, redundancy_cancel_others_on_first_done};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn echo() -> Work {
        Work::new(
            "echo",
            Arc::new(|context: WorkContext| {
                async move {
                    let events = context.run("/bin/echo", vec!["hi".into()]).await?;
                    Ok::<Value, anyhow::Error>(json!(events[0].stdout))
                }
                .boxed()
            }),
        )
    }

    #[tokio::test]
    async fn each_work_gets_a_fresh_activity() {
        let market = FakeMarket::new(Session::new());
        let manager = Arc::new(SingleUseActivityManager::new(agreements(&market, &["a", "b"])));
        manager.start().await.unwrap();
        let do_work = manager.do_work_fn();

        assert_eq!(do_work(echo()).await, WorkResult::success(json!("hi")));
        assert_eq!(do_work(echo()).await, WorkResult::success(json!("hi")));

        assert_eq!(market.activities().len(), 2);
        assert_eq!(market.destroyed(), market.activities());
        assert_eq!(market.released().len(), 2);
    }

    #[tokio::test]
    async fn failed_activity_moves_to_next_agreement() {
        let market = FakeMarket::new(Session::new());
        market.fail_activity("broken");
        let manager = SingleUseActivityManager::new(agreements(&market, &["broken", "good"]));
        manager.start().await.unwrap();

        let result = manager.do_work(echo()).await;
        assert!(result.is_success());
        assert_eq!(market.released().len(), 2);
        assert_eq!(market.activities().len(), 1);
    }

    #[tokio::test]
    async fn work_failure_still_cleans_up() {
        let market = FakeMarket::new(Session::new());
        market.fail_commands("a");
        let manager = SingleUseActivityManager::new(agreements(&market, &["a"]))
            .with_on_activity_start(None);
        manager.start().await.unwrap();

        let result = manager.do_work(echo()).await;
        assert!(matches!(result.error, Some(WorkError::Resource(_))));
        assert_eq!(market.destroyed().len(), 1);
        assert_eq!(market.released().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_redundant_attempt_releases_its_lease() {
        let market = FakeMarket::new(Session::new());
        let manager = Arc::new(SingleUseActivityManager::new(agreements(&market, &["a", "b"])));
        manager.start().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let work = Work::new(
            "first wins",
            Arc::new(move |_: WorkContext| {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    let delay = if call == 0 { 1 } else { 3600 };
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                    Ok::<Value, anyhow::Error>(json!(call))
                }
                .boxed()
            }),
        );

        let do_work = redundancy_cancel_others_on_first_done(2)(manager.do_work_fn());
        assert_eq!(do_work(work).await, WorkResult::success(json!(0)));
        settle().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(market.activities().len(), 2);
        assert_eq!(market.destroyed().len(), 2);
        assert_eq!(market.released().len(), 2);
    }

    #[tokio::test]
    async fn missing_agreement_fails_the_work() {
        let market = FakeMarket::new(Session::new());
        let manager = SingleUseActivityManager::new(agreements(&market, &[]));
        assert_eq!(
            manager.do_work(echo()).await.error,
            Some(WorkError::Manager(ManagerError::NotStarted("single use activity manager")))
        );

        manager.start().await.unwrap();
        assert_eq!(
            manager.do_work(echo()).await.error,
            Some(WorkError::Manager(ManagerError::Supply("no more agreements".into())))
        );
    }
}
