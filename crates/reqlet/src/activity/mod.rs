//! Leasing activities on agreements.
//!
//! [`SingleUseActivityManager`] creates one activity per work item and tears
//! it down afterwards. [`ActivityPool`] and [`ActivityPoolManager`] keep a
//! bounded set of activities alive and hand out the idle ones.

mod pool;
mod single_use;

use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::manager::{ActivitySource, AgreementSource};
use crate::resource::{Activity, Agreement};
use crate::work::{WorkContext, WorkError};

pub use pool::{ActivityPool, ActivityPoolManager};
pub use single_use::SingleUseActivityManager;

/// Callback run on an activity right after creation or right before release.
pub type ActivityHook =
    Arc<dyn Fn(WorkContext) -> BoxFuture<'static, Result<(), WorkError>> + Send + Sync>;

/// Deploy and start the activity in one batch.
pub fn default_on_activity_start() -> ActivityHook {
    Arc::new(|context: WorkContext| {
        async move {
            context.batch().deploy(None).start().execute().await?;
            Ok(())
        }
        .boxed()
    })
}

/// Destroy the activity.
pub fn default_on_activity_stop() -> ActivityHook {
    Arc::new(|context: WorkContext| async move { context.terminate().await }.boxed())
}

/// Create an activity on `agreement` and run the start hook on it.
pub(crate) async fn prepare_activity(
    agreement: &Agreement,
    on_start: Option<&ActivityHook>,
) -> Result<Activity, WorkError> {
    let activity = create_activity(agreement).await?;
    start_activity(&activity, on_start).await?;
    Ok(activity)
}

pub(crate) async fn create_activity(agreement: &Agreement) -> Result<Activity, WorkError> {
    let activity = agreement.create_activity().await?;
    tracing::info!(target: "reqlet::activity", activity_id = %activity.id(), agreement_id = %agreement.id(), "Activity created");
    Ok(activity)
}

/// Run the start hook, destroying the activity when it fails.
pub(crate) async fn start_activity(activity: &Activity, on_start: Option<&ActivityHook>) -> Result<(), WorkError> {
    let Some(hook) = on_start else {
        return Ok(());
    };
    if let Err(e) = hook(WorkContext::new(activity.clone())).await {
        if let Err(destroy_error) = activity.destroy().await {
            tracing::warn!(target: "reqlet::activity", activity_id = %activity.id(), error = %destroy_error, "Failed to destroy unstarted activity");
        }
        return Err(e);
    }
    Ok(())
}

/// Run the stop hook. The activity is expected to be destroyed afterwards.
pub(crate) async fn release_activity(activity: &Activity, on_stop: Option<&ActivityHook>) {
    if let Some(hook) = on_stop {
        if let Err(e) = hook(WorkContext::new(activity.clone())).await {
            tracing::warn!(target: "reqlet::activity", activity_id = %activity.id(), error = %e, "Activity stop hook failed");
        }
    }
    if activity.is_destroyed() {
        tracing::info!(target: "reqlet::activity", activity_id = %activity.id(), "Activity destroyed");
    } else {
        tracing::warn!(
            target: "reqlet::activity",
            activity_id = %activity.id(),
            "Activity released without being destroyed, the stop hook should terminate it"
        );
    }
}

/// Mark the agreement as no longer used, logging failures.
pub(crate) async fn release_agreement(agreement: &Agreement) {
    if let Err(e) = agreement.release().await {
        tracing::warn!(target: "reqlet::activity", agreement_id = %agreement.id(), error = %e, "Failed to release agreement");
    }
}

/// Source of started activities, each on a fresh agreement.
///
/// When an activity cannot be created or started, its agreement is released
/// and the next agreement is tried.
pub fn prepared_activities(
    agreement_source: AgreementSource,
    on_start: Option<ActivityHook>,
) -> ActivitySource {
    Arc::new(move || {
        let agreement_source = Arc::clone(&agreement_source);
        let on_start = on_start.clone();
        async move {
            loop {
                let agreement = agreement_source().await?;
                match prepare_activity(&agreement, on_start.as_ref()).await {
                    Ok(activity) => return Ok(activity),
                    Err(e) => {
                        tracing::warn!(target: "reqlet::activity", agreement_id = %agreement.id(), error = %e, "Creating activity failed, retrying with a new agreement");
                        release_agreement(&agreement).await;
                    }
                }
            }
        }
        .boxed()
    })
}
