use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use tokio::task::JoinSet;

use super::{DoWork, Work, WorkManager, WorkPlugin, WorkResult, on_leased_activity, with_plugins};
use crate::manager::{ActivitySource, Manager, ManagerError, StartedFlag};

/// Runs a work list on up to `size` activities at once.
///
/// `size` workers pull from one shared queue, so each item runs exactly once.
/// Results of [`do_work_list`](WorkManager::do_work_list) come back in
/// completion order.
pub struct ConcurrentWorkManager {
    base: DoWork,
    size: usize,
    plugins: Vec<WorkPlugin>,
    started: StartedFlag,
}

impl ConcurrentWorkManager {
    pub fn new(activity_source: ActivitySource, size: usize) -> Self {
        Self {
            base: on_leased_activity(activity_source),
            size: size.max(1),
            plugins: Vec::new(),
            started: StartedFlag::new("concurrent work manager"),
        }
    }

    pub fn with_plugins(mut self, plugins: Vec<WorkPlugin>) -> Self {
        self.plugins = plugins;
        self
    }

    fn prepared(&self, work: &Work) -> DoWork {
        with_plugins(Arc::clone(&self.base), &self.plugins, work)
    }
}

#[async_trait]
impl WorkManager for ConcurrentWorkManager {
    async fn do_work(&self, work: Work) -> WorkResult {
        if !self.started.is_started() {
            return WorkResult::failure(ManagerError::NotStarted("concurrent work manager").into());
        }
        self.prepared(&work)(work).await
    }

    async fn do_work_list(&self, works: Vec<Work>) -> Vec<WorkResult> {
        if !self.started.is_started() {
            return works
                .iter()
                .map(|_| WorkResult::failure(ManagerError::NotStarted("concurrent work manager").into()))
                .collect();
        }

        let total = works.len();
        let queue: Arc<StdMutex<VecDeque<(Work, DoWork)>>> = Arc::new(StdMutex::new(
            works
                .into_iter()
                .map(|work| {
                    let do_work = self.prepared(&work);
                    (work, do_work)
                })
                .collect(),
        ));

        let mut workers = JoinSet::new();
        for worker in 0..self.size.min(total) {
            let queue = Arc::clone(&queue);
            workers.spawn(async move {
                let mut results = Vec::new();
                loop {
                    let next = match queue.lock() {
                        Ok(mut queue) => queue.pop_front(),
                        Err(poisoned) => poisoned.into_inner().pop_front(),
                    };
                    let Some((work, do_work)) = next else {
                        break;
                    };
                    tracing::debug!(target: "reqlet::work", worker, work = %work.name(), "Worker picked up work");
                    results.push(do_work(work).await);
                }
                results
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(finished) = workers.join_next().await {
            match finished {
                Ok(done) => results.extend(done),
                Err(e) => {
                    tracing::error!(target: "reqlet::work", error = %e, "Work worker failed");
                }
            }
        }
        tracing::info!(target: "reqlet::work", total, completed = results.len(), "Work list completed");
        results
    }
}

#[async_trait]
impl Manager for ConcurrentWorkManager {
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
