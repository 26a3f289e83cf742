use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, MutexGuard, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use futures::StreamExt;
use futures::stream;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use super::release_agreement;
use crate::buffer::{Buffer, BufferError, SimpleBuffer};
use crate::event_bus::{EventBus, EventCallback, EventKind, HandlerId, ResourceEvent};
use crate::manager::{ActivitySource, Manager, ManagerError};
use crate::pipeline::{ItemStream, MaybePending, PendingHandle, PipelineError, Stage};
use crate::resource::Activity;
use crate::session::Session;

/// One activity under management, keyed by slot number.
struct Managed {
    /// `None` until the upstream item resolves.
    activity: Option<Activity>,
    events: mpsc::UnboundedSender<EventKind>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct PoolState {
    next_slot: u64,
    managed: HashMap<u64, Managed>,
    exhausted: bool,
    /// Last upstream failure, handed to the next caller waiting for an activity.
    failure: Option<PipelineError>,
}

struct PoolCore {
    max_size: usize,
    event_bus: Arc<EventBus>,
    upstream: tokio::sync::Mutex<ItemStream<Activity>>,
    idle: SimpleBuffer<Activity>,
    state: StdMutex<PoolState>,
    changed: Notify,
    handlers: StdMutex<Vec<HandlerId>>,
}

impl PoolCore {
    fn new(event_bus: Arc<EventBus>, upstream: ItemStream<Activity>, max_size: usize) -> Arc<Self> {
        let core = Arc::new(Self {
            max_size: max_size.max(1),
            event_bus,
            upstream: tokio::sync::Mutex::new(upstream),
            idle: SimpleBuffer::new(),
            state: StdMutex::new(PoolState::default()),
            changed: Notify::new(),
            handlers: StdMutex::new(Vec::new()),
        });
        core.subscribe();
        core
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::activity", "Pool state poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<HandlerId>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn subscribe(self: &Arc<Self>) {
        let kinds = [
            EventKind::ActivityBusy,
            EventKind::ActivityIdle,
            EventKind::ActivityDestroyed,
        ];
        let ids: Vec<HandlerId> = kinds
            .into_iter()
            .map(|kind| {
                let core = Arc::downgrade(self);
                let callback: EventCallback = Arc::new(move |event: ResourceEvent| {
                    let core = core.clone();
                    async move {
                        if let Some(core) = core.upgrade() {
                            core.on_event(event).await;
                        }
                        Ok::<(), anyhow::Error>(())
                    }
                    .boxed()
                });
                self.event_bus.on(kind, callback, None)
            })
            .collect();
        *self.handlers() = ids;
    }

    async fn on_event(&self, event: ResourceEvent) {
        match event {
            ResourceEvent::ActivityDestroyed(activity) => self.forget(&activity).await,
            other => {
                let state = self.state();
                if let Some((_, managed)) = find(&state, other.resource_id()) {
                    // A closed channel means the manager task is already gone.
                    let _ = managed.events.send(other.kind());
                }
            }
        }
    }

    /// Drop a destroyed activity from the pool. It is not replaced eagerly.
    async fn forget(&self, activity: &Activity) {
        let removed = {
            let mut state = self.state();
            let slot = find(&state, activity.id()).map(|(slot, _)| slot);
            slot.and_then(|slot| state.managed.remove(&slot))
        };
        let Some(managed) = removed else {
            return;
        };
        managed.task.abort();
        match self.idle.remove(activity).await {
            Ok(()) | Err(BufferError::NotFound) => {}
            Err(e) => {
                tracing::warn!(target: "reqlet::activity", activity_id = %activity.id(), error = %e, "Failed to drop activity from idle list");
            }
        }
        tracing::info!(target: "reqlet::activity", activity_id = %activity.id(), "Destroyed activity left the pool");
        self.changed.notify_waiters();
    }

    fn set_activity(&self, slot: u64, activity: &Activity) -> bool {
        match self.state().managed.get_mut(&slot) {
            Some(managed) => {
                managed.activity = Some(activity.clone());
                true
            }
            None => false,
        }
    }

    fn release_slot(&self, slot: u64, error: Option<PipelineError>) {
        let mut state = self.state();
        state.managed.remove(&slot);
        match error {
            Some(PipelineError::InputExhausted) => state.exhausted = true,
            Some(e) => state.failure = Some(e),
            None => {}
        }
        drop(state);
        self.changed.notify_waiters();
    }

    fn is_drained(&self) -> bool {
        let state = self.state();
        state.exhausted && state.managed.is_empty() && self.idle.size() == 0
    }

    fn size(&self) -> usize {
        self.state().managed.len()
    }

    /// Wait for an idle activity, growing the pool by one when nothing is
    /// idle and there is room.
    async fn next_idle(self: &Arc<Self>) -> Result<Activity, PipelineError> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let idle = self
                .idle
                .try_get()
                .map_err(|e| PipelineError::Failed(e.to_string()))?;
            if let Some(activity) = idle {
                if activity.is_destroyed() {
                    continue;
                }
                return Ok(activity);
            }

            let (full, exhausted, empty) = {
                let mut state = self.state();
                if let Some(failure) = state.failure.take() {
                    return Err(failure);
                }
                (
                    state.managed.len() >= self.max_size,
                    state.exhausted,
                    state.managed.is_empty(),
                )
            };
            if !full && !exhausted {
                self.pull().await;
            } else if exhausted && empty {
                return Err(PipelineError::InputExhausted);
            }
            notified.await;
        }
    }

    /// Take one item from upstream and start managing it.
    async fn pull(self: &Arc<Self>) {
        let mut upstream = self.upstream.lock().await;
        {
            let state = self.state();
            if state.exhausted || state.managed.len() >= self.max_size || self.idle.size() > 0 {
                return;
            }
        }
        let Some(item) = upstream.next().await else {
            tracing::debug!(target: "reqlet::activity", "Activity upstream exhausted");
            self.state().exhausted = true;
            self.changed.notify_waiters();
            return;
        };

        let (events, receiver) = mpsc::unbounded_channel();
        let mut state = self.state();
        let slot = state.next_slot;
        state.next_slot += 1;
        let task = tokio::spawn(manage(Arc::downgrade(self), slot, item, receiver));
        state.managed.insert(
            slot,
            Managed {
                activity: None,
                events,
                task,
            },
        );
        tracing::debug!(target: "reqlet::activity", slot, size = state.managed.len(), max_size = self.max_size, "Pool grew");
    }

    /// Stop managing everything. Returns the activities that were managed.
    async fn shutdown(&self) -> Vec<Activity> {
        for id in std::mem::take(&mut *self.handlers()) {
            let _ = self.event_bus.off(id);
        }
        let managed: Vec<Managed> = {
            let mut state = self.state();
            state.exhausted = true;
            state.managed.drain().map(|(_, managed)| managed).collect()
        };
        let mut activities = Vec::with_capacity(managed.len());
        for Managed { activity, task, .. } in managed {
            task.abort();
            let _ = task.await;
            activities.extend(activity);
        }
        self.idle.get_all().await;
        self.changed.notify_waiters();
        activities
    }
}

impl Drop for PoolCore {
    fn drop(&mut self) {
        for id in self.handlers().drain(..) {
            let _ = self.event_bus.off(id);
        }
        for managed in self.state().managed.values() {
            managed.task.abort();
        }
    }
}

fn find<'a>(state: &'a PoolState, activity_id: &str) -> Option<(u64, &'a Managed)> {
    state.managed.iter().find_map(|(slot, managed)| {
        managed
            .activity
            .as_ref()
            .filter(|activity| activity.id() == activity_id)
            .map(|_| (*slot, managed))
    })
}

/// Wait until an event of `kind` arrives. False once the channel closes.
async fn wait_for(events: &mut mpsc::UnboundedReceiver<EventKind>, kind: EventKind) -> bool {
    while let Some(event) = events.recv().await {
        if event == kind {
            return true;
        }
    }
    false
}

/// Keep one activity in the idle list whenever it is not busy.
async fn manage(
    core: Weak<PoolCore>,
    slot: u64,
    item: MaybePending<Activity>,
    mut events: mpsc::UnboundedReceiver<EventKind>,
) {
    let activity = match item.resolve().await {
        Ok(activity) if !activity.is_destroyed() => activity,
        Ok(activity) => {
            tracing::debug!(target: "reqlet::activity", activity_id = %activity.id(), "Skipping destroyed activity");
            if let Some(core) = core.upgrade() {
                core.release_slot(slot, None);
            }
            return;
        }
        Err(e) => {
            if !matches!(e, PipelineError::InputExhausted) {
                tracing::warn!(target: "reqlet::activity", error = %e, "Getting activity for pool failed");
            }
            if let Some(core) = core.upgrade() {
                core.release_slot(slot, Some(e));
            }
            return;
        }
    };
    match core.upgrade() {
        Some(core) if core.set_activity(slot, &activity) => {}
        _ => return,
    }
    tracing::info!(target: "reqlet::activity", activity_id = %activity.id(), slot, "Activity joined the pool");

    loop {
        {
            let Some(core) = core.upgrade() else {
                return;
            };
            core.idle.put(activity.clone()).await;
            core.changed.notify_waiters();
        }
        if !wait_for(&mut events, EventKind::ActivityBusy).await {
            return;
        }
        {
            let Some(core) = core.upgrade() else {
                return;
            };
            match core.idle.remove(&activity).await {
                Ok(()) | Err(BufferError::NotFound) => {}
                Err(e) => {
                    tracing::warn!(target: "reqlet::activity", activity_id = %activity.id(), error = %e, "Failed to mark activity busy");
                }
            }
        }
        tracing::trace!(target: "reqlet::activity", activity_id = %activity.id(), "Activity busy");
        if !wait_for(&mut events, EventKind::ActivityIdle).await {
            return;
        }
        tracing::trace!(target: "reqlet::activity", activity_id = %activity.id(), "Activity idle");
    }
}

/// Pipeline stage keeping up to `max_size` upstream activities and emitting
/// whichever of them is idle.
///
/// Upstream items are pulled one at a time, only when no managed activity is
/// idle. The output ends once upstream is exhausted and every managed
/// activity has been destroyed.
pub struct ActivityPool {
    event_bus: Arc<EventBus>,
    max_size: usize,
}

impl ActivityPool {
    pub fn new(session: &Session, max_size: usize) -> Self {
        Self {
            event_bus: Arc::clone(session.event_bus()),
            max_size,
        }
    }
}

impl Stage<Activity> for ActivityPool {
    type Out = Activity;

    fn apply(self, input: ItemStream<Activity>) -> ItemStream<Activity> {
        let core = PoolCore::new(self.event_bus, input, self.max_size);
        stream::unfold(core, |core| async move {
            if core.is_drained() {
                return None;
            }
            let next = Arc::clone(&core);
            let handle = PendingHandle::spawn(async move { next.next_idle().await });
            Some((MaybePending::Pending(handle), core))
        })
        .boxed()
    }
}

/// Pool of at most `max_size` activities obtained from an [`ActivitySource`].
///
/// [`get_activity`](Self::get_activity) hands out an idle activity, creating a
/// new one only when none is idle and the pool is not full. On stop every
/// managed activity is destroyed and its agreement released.
pub struct ActivityPoolManager {
    session: Arc<Session>,
    source: ActivitySource,
    max_size: usize,
    core: StdMutex<Option<Arc<PoolCore>>>,
}

impl ActivityPoolManager {
    pub fn new(session: Arc<Session>, source: ActivitySource, max_size: usize) -> Self {
        Self {
            session,
            source,
            max_size,
            core: StdMutex::new(None),
        }
    }

    fn core(&self) -> MutexGuard<'_, Option<Arc<PoolCore>>> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::activity", "Pool handle poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn started_core(&self) -> Result<Arc<PoolCore>, ManagerError> {
        self.core()
            .as_ref()
            .map(Arc::clone)
            .ok_or(ManagerError::NotStarted("activity pool"))
    }

    pub async fn get_activity(&self) -> Result<Activity, ManagerError> {
        let core = self.started_core()?;
        core.next_idle().await.map_err(|e| match e {
            PipelineError::InputExhausted => ManagerError::Supply("activity source exhausted".into()),
            PipelineError::Failed(message) => ManagerError::Supply(message),
            other => ManagerError::Supply(other.to_string()),
        })
    }

    pub fn activity_source(self: &Arc<Self>) -> ActivitySource {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = Arc::clone(&manager);
            async move { manager.get_activity().await }.boxed()
        })
    }

    /// Number of managed activities, busy or idle.
    pub fn size(&self) -> usize {
        self.core().as_ref().map_or(0, |core| core.size())
    }

    pub fn idle_size(&self) -> usize {
        self.core().as_ref().map_or(0, |core| core.idle.size())
    }
}

#[async_trait]
impl Manager for ActivityPoolManager {
    async fn start(&self) -> Result<(), ManagerError> {
        let mut core = self.core();
        if core.is_some() {
            return Err(ManagerError::AlreadyStarted("activity pool"));
        }
        let source = Arc::clone(&self.source);
        let upstream: ItemStream<Activity> = stream::repeat_with(move || {
            let source = Arc::clone(&source);
            MaybePending::Pending(PendingHandle::spawn(async move {
                source()
                    .await
                    .map_err(|e| PipelineError::Failed(e.to_string()))
            }))
        })
        .boxed();
        *core = Some(PoolCore::new(
            Arc::clone(self.session.event_bus()),
            upstream,
            self.max_size,
        ));
        tracing::info!(target: "reqlet::activity", max_size = self.max_size, "Activity pool started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        let core = self
            .core()
            .take()
            .ok_or(ManagerError::NotStarted("activity pool"))?;
        let activities = core.shutdown().await;
        let released = activities.len();
        futures::future::join_all(activities.into_iter().map(|activity| async move {
            if let Err(e) = activity.destroy().await {
                tracing::warn!(target: "reqlet::activity", activity_id = %activity.id(), error = %e, "Failed to destroy pooled activity");
            }
            release_agreement(&activity.agreement()).await;
        }))
        .await;
        tracing::info!(target: "reqlet::activity", released, "Activity pool stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.core().is_some()
    }
}
