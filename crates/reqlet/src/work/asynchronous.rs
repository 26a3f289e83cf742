use std::sync::Arc;

use async_trait::async_trait;

use super::{DoWork, Work, WorkManager, WorkPlugin, WorkResult, with_plugins};
use crate::manager::{Manager, ManagerError, StartedFlag};

/// Runs every work item at once through a caller-supplied [`DoWork`].
///
/// Typically fed by an activity manager, e.g.
/// [`SingleUseActivityManager::do_work_fn`](crate::activity::SingleUseActivityManager::do_work_fn).
/// Results of a list keep the list order.
pub struct AsynchronousWorkManager {
    base: DoWork,
    plugins: Vec<WorkPlugin>,
    started: StartedFlag,
}

impl AsynchronousWorkManager {
    pub fn new(do_work: DoWork) -> Self {
        Self {
            base: do_work,
            plugins: Vec::new(),
            started: StartedFlag::new("asynchronous work manager"),
        }
    }

    pub fn with_plugins(mut self, plugins: Vec<WorkPlugin>) -> Self {
        self.plugins = plugins;
        self
    }
}

#[async_trait]
impl WorkManager for AsynchronousWorkManager {
    async fn do_work(&self, work: Work) -> WorkResult {
        if !self.started.is_started() {
            return WorkResult::failure(ManagerError::NotStarted("asynchronous work manager").into());
        }
        let name = work.name().to_string();
        let result = with_plugins(Arc::clone(&self.base), &self.plugins, &work)(work).await;
        tracing::info!(target: "reqlet::work", work = %name, success = result.is_success(), "Work completed");
        result
    }

    async fn do_work_list(&self, works: Vec<Work>) -> Vec<WorkResult> {
        futures::future::join_all(works.into_iter().map(|work| self.do_work(work))).await
    }
}

#[async_trait]
impl Manager for AsynchronousWorkManager {
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
