use async_trait::async_trait;

use super::{DoWork, Work, WorkManager, WorkPlugin, WorkResult, on_leased_activity, with_plugins};
use crate::manager::{ActivitySource, Manager, ManagerError, StartedFlag};

/// Runs work one item at a time, each on an activity from the source.
pub struct SequentialWorkManager {
    base: DoWork,
    plugins: Vec<WorkPlugin>,
    started: StartedFlag,
}

impl SequentialWorkManager {
    pub fn new(activity_source: ActivitySource) -> Self {
        Self {
            base: on_leased_activity(activity_source),
            plugins: Vec::new(),
            started: StartedFlag::new("sequential work manager"),
        }
    }

    pub fn with_plugins(mut self, plugins: Vec<WorkPlugin>) -> Self {
        self.plugins = plugins;
        self
    }
}

#[async_trait]
impl WorkManager for SequentialWorkManager {
    async fn do_work(&self, work: Work) -> WorkResult {
        if !self.started.is_started() {
            return WorkResult::failure(ManagerError::NotStarted("sequential work manager").into());
        }
        let do_work = with_plugins(std::sync::Arc::clone(&self.base), &self.plugins, &work);
        let name = work.name().to_string();
        let result = do_work(work).await;
        tracing::info!(target: "reqlet::work", work = %name, success = result.is_success(), "Work completed");
        result
    }

    async fn do_work_list(&self, works: Vec<Work>) -> Vec<WorkResult> {
        let mut results = Vec::with_capacity(works.len());
        for work in works {
            results.push(self.do_work(work).await);
        }
        results
    }
}

#[async_trait]
impl Manager for SequentialWorkManager {
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
