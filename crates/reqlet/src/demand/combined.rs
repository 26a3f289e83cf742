use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::manager::{Manager, ManagerError, ProposalSource, StartedFlag};
use crate::resource::Proposal;

type SourceResult = Result<Proposal, ManagerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadyOrder {
    /// Hand out results in the order they completed.
    Completion,
    /// Among completed results, prefer the source declared first.
    Declaration,
}

#[derive(Default)]
enum Slot {
    #[default]
    Idle,
    Running(JoinHandle<()>),
}

struct State {
    slots: Vec<Slot>,
    /// Completed results not yet handed out, as (source index, result).
    ready: VecDeque<(usize, SourceResult)>,
}

/// Drives every source with at most one outstanding call and caches results.
struct SourceSet {
    name: &'static str,
    sources: Vec<ProposalSource>,
    order: ReadyOrder,
    state: StdMutex<State>,
    completed: Notify,
    started: StartedFlag,
}

impl SourceSet {
    fn new(name: &'static str, sources: Vec<ProposalSource>, order: ReadyOrder) -> Arc<Self> {
        let slots = sources.iter().map(|_| Slot::Idle).collect();
        Arc::new(Self {
            name,
            sources,
            order,
            state: StdMutex::new(State {
                slots,
                ready: VecDeque::new(),
            }),
            completed: Notify::new(),
            started: StartedFlag::new(name),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::demand", name = self.name, "Source state poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn take_ready(&self, state: &mut State) -> Option<SourceResult> {
        let position = match self.order {
            ReadyOrder::Completion => 0,
            ReadyOrder::Declaration => state
                .ready
                .iter()
                .enumerate()
                .min_by_key(|(_, (index, _))| *index)
                .map(|(position, _)| position)?,
        };
        state.ready.remove(position).map(|(_, result)| result)
    }

    fn drive_idle(self: &Arc<Self>, state: &mut State) {
        for (index, slot) in state.slots.iter_mut().enumerate() {
            if !matches!(slot, Slot::Idle) {
                continue;
            }
            let set = Arc::clone(self);
            let source = Arc::clone(&self.sources[index]);
            tracing::trace!(target: "reqlet::demand", name = self.name, source = index, "Driving source");
            *slot = Slot::Running(tokio::spawn(async move {
                let result = source().await;
                set.complete(index, result);
            }));
        }
    }

    fn complete(&self, index: usize, result: SourceResult) {
        if let Err(e) = &result {
            tracing::warn!(target: "reqlet::demand", name = self.name, source = index, error = %e, "Source failed");
        }
        let mut state = self.state();
        state.slots[index] = Slot::Idle;
        state.ready.push_back((index, result));
        drop(state);
        self.completed.notify_waiters();
    }

    async fn get(self: &Arc<Self>) -> SourceResult {
        if !self.started.is_started() {
            return Err(ManagerError::NotStarted(self.name));
        }
        loop {
            let notified = self.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(result) = self.take_ready(&mut state) {
                    return result;
                }
                self.drive_idle(&mut state);
            }

            notified.await;
        }
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.started.stop()?;
        let handles: Vec<JoinHandle<()>> = {
            let mut state = self.state();
            state.ready.clear();
            state
                .slots
                .iter_mut()
                .filter_map(|slot| match std::mem::take(slot) {
                    Slot::Running(handle) => Some(handle),
                    Slot::Idle => None,
                })
                .collect()
        };
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        // Aborted calls may have completed in the meantime.
        let mut state = self.state();
        state.ready.clear();
        for slot in state.slots.iter_mut() {
            *slot = Slot::Idle;
        }
        Ok(())
    }
}

fn source_of(set: &Arc<SourceSet>) -> ProposalSource {
    let set = Arc::clone(set);
    Arc::new(move || {
        let set = Arc::clone(&set);
        async move { set.get().await }.boxed()
    })
}

/// Merges several offer sources, handing out offers in completion order.
///
/// Results that completed while nobody was asking are kept and returned first.
/// A failing source returns its error in place of an offer.
pub struct AggregatingDemandManager {
    sources: Arc<SourceSet>,
}

impl AggregatingDemandManager {
    pub fn new(sources: Vec<ProposalSource>) -> Self {
        Self {
            sources: SourceSet::new("aggregating demand manager", sources, ReadyOrder::Completion),
        }
    }

    pub async fn get_initial_proposal(&self) -> Result<Proposal, ManagerError> {
        self.sources.get().await
    }

    pub fn initial_source(&self) -> ProposalSource {
        source_of(&self.sources)
    }
}

#[async_trait]
impl Manager for AggregatingDemandManager {
    async fn start(&self) -> Result<(), ManagerError> {
        self.sources.started.start()
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.sources.stop().await?;
        tracing::info!(target: "reqlet::demand", "Aggregating demand manager stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.sources.started.is_started()
    }
}

/// Merges several offer sources, preferring earlier sources when several
/// results are ready at once.
pub struct UnionDemandManager {
    sources: Arc<SourceSet>,
}

impl UnionDemandManager {
    pub fn new(sources: Vec<ProposalSource>) -> Self {
        Self {
            sources: SourceSet::new("union demand manager", sources, ReadyOrder::Declaration),
        }
    }

    pub async fn get_initial_proposal(&self) -> Result<Proposal, ManagerError> {
        self.sources.get().await
    }

    pub fn initial_source(&self) -> ProposalSource {
        source_of(&self.sources)
    }
}

#[async_trait]
impl Manager for UnionDemandManager {
    async fn start(&self) -> Result<(), ManagerError> {
        self.sources.started.start()
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.sources.stop().await?;
        tracing::info!(target: "reqlet::demand", "Union demand manager stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.sources.started.is_started()
    }
}
