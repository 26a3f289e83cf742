//! In-memory notifier through which components learn about resource changes.
//!
//! Events are queued by [`EventBus::emit`] and dispatched by a single task, so
//! every callback for one event finishes before the next event is looked at.
//! A failing callback is logged and does not affect the others.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::resource::{Activity, Agreement, DebitNote, Demand, Invoice, Proposal, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewResource,
    ActivityBusy,
    ActivityIdle,
    ActivityDestroyed,
    AgreementReleased,
    AgreementTerminated,
    ProposalRejected,
    DemandUnsubscribed,
    InvoiceReceived,
    DebitNoteReceived,
}

#[derive(Debug, Clone)]
pub enum ResourceEvent {
    NewResource { kind: ResourceKind, id: String },
    ActivityBusy(Activity),
    ActivityIdle(Activity),
    ActivityDestroyed(Activity),
    AgreementReleased(Agreement),
    AgreementTerminated(Agreement),
    ProposalRejected(Proposal),
    DemandUnsubscribed(Demand),
    InvoiceReceived(Invoice),
    DebitNoteReceived(DebitNote),
}

impl ResourceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ResourceEvent::NewResource { .. } => EventKind::NewResource,
            ResourceEvent::ActivityBusy(_) => EventKind::ActivityBusy,
            ResourceEvent::ActivityIdle(_) => EventKind::ActivityIdle,
            ResourceEvent::ActivityDestroyed(_) => EventKind::ActivityDestroyed,
            ResourceEvent::AgreementReleased(_) => EventKind::AgreementReleased,
            ResourceEvent::AgreementTerminated(_) => EventKind::AgreementTerminated,
            ResourceEvent::ProposalRejected(_) => EventKind::ProposalRejected,
            ResourceEvent::DemandUnsubscribed(_) => EventKind::DemandUnsubscribed,
            ResourceEvent::InvoiceReceived(_) => EventKind::InvoiceReceived,
            ResourceEvent::DebitNoteReceived(_) => EventKind::DebitNoteReceived,
        }
    }

    /// Id of the resource the event is about.
    pub fn resource_id(&self) -> &str {
        match self {
            ResourceEvent::NewResource { id, .. } => id,
            ResourceEvent::ActivityBusy(activity)
            | ResourceEvent::ActivityIdle(activity)
            | ResourceEvent::ActivityDestroyed(activity) => activity.id(),
            ResourceEvent::AgreementReleased(agreement)
            | ResourceEvent::AgreementTerminated(agreement) => agreement.id(),
            ResourceEvent::ProposalRejected(proposal) => proposal.id(),
            ResourceEvent::DemandUnsubscribed(demand) => demand.id(),
            ResourceEvent::InvoiceReceived(invoice) => invoice.id(),
            ResourceEvent::DebitNoteReceived(debit_note) => debit_note.id(),
        }
    }
}

pub type EventCallback =
    Arc<dyn Fn(ResourceEvent) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub type EventFilter = Arc<dyn Fn(&ResourceEvent) -> bool + Send + Sync>;

/// Returned by [`EventBus::on`]; pass to [`EventBus::off`] to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is already started")]
    AlreadyStarted,
    #[error("Event bus is not started")]
    NotStarted,
    #[error("Callback handler {0:?} not found")]
    HandlerNotFound(HandlerId),
}

struct Handler {
    id: HandlerId,
    kind: EventKind,
    callback: EventCallback,
    filter: Option<EventFilter>,
    once: bool,
}

struct Shared {
    handlers: StdMutex<Vec<Handler>>,
}

impl Shared {
    fn handlers(&self) -> MutexGuard<'_, Vec<Handler>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::event_bus", "Handler list poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Matching callbacks in registration order. One-shot handlers are removed here.
    fn take_matching(&self, event: &ResourceEvent) -> Vec<(HandlerId, EventCallback)> {
        let kind = event.kind();
        let mut handlers = self.handlers();
        let mut matching = Vec::new();
        handlers.retain(|handler| {
            if handler.kind != kind {
                return true;
            }
            if let Some(filter) = &handler.filter {
                if !filter(event) {
                    return true;
                }
            }
            matching.push((handler.id, Arc::clone(&handler.callback)));
            !handler.once
        });
        matching
    }

    async fn dispatch(&self, event: ResourceEvent) {
        let callbacks = self.take_matching(&event);
        tracing::trace!(
            target: "reqlet::event_bus",
            kind = ?event.kind(),
            resource_id = %event.resource_id(),
            callbacks = callbacks.len(),
            "Dispatching event"
        );
        for (handler_id, callback) in callbacks {
            if let Err(e) = callback(event.clone()).await {
                tracing::error!(
                    target: "reqlet::event_bus",
                    ?handler_id,
                    kind = ?event.kind(),
                    error = %format!("{e:#}"),
                    "Event callback failed"
                );
            }
        }
    }
}

pub struct EventBus {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    sender: StdMutex<Option<mpsc::UnboundedSender<ResourceEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                handlers: StdMutex::new(Vec::new()),
            }),
            next_id: AtomicU64::new(0),
            sender: StdMutex::new(None),
            task: Mutex::new(None),
        }
    }

    fn sender(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ResourceEvent>>> {
        match self.sender.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::event_bus", "Sender slot poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub async fn start(&self) -> Result<(), EventBusError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(EventBusError::AlreadyStarted);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ResourceEvent>();
        let shared = Arc::clone(&self.shared);
        *task = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                shared.dispatch(event).await;
            }
        }));
        *self.sender() = Some(tx);

        tracing::debug!(target: "reqlet::event_bus", "Event bus started");
        Ok(())
    }

    /// Stop accepting events, then wait until every queued event is dispatched.
    pub async fn stop(&self) -> Result<(), EventBusError> {
        let mut task = self.task.lock().await;
        let Some(handle) = task.take() else {
            return Err(EventBusError::NotStarted);
        };

        self.sender().take();
        if let Err(e) = handle.await {
            tracing::error!(target: "reqlet::event_bus", error = %e, "Dispatch task failed");
        }

        tracing::debug!(target: "reqlet::event_bus", "Event bus stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.sender().is_some()
    }

    pub fn on(
        &self,
        kind: EventKind,
        callback: EventCallback,
        filter: Option<EventFilter>,
    ) -> HandlerId {
        self.register(kind, callback, filter, false)
    }

    /// Like [`on`](Self::on), but the handler is dropped after its first matching event.
    pub fn on_once(
        &self,
        kind: EventKind,
        callback: EventCallback,
        filter: Option<EventFilter>,
    ) -> HandlerId {
        self.register(kind, callback, filter, true)
    }

    fn register(
        &self,
        kind: EventKind,
        callback: EventCallback,
        filter: Option<EventFilter>,
        once: bool,
    ) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.handlers().push(Handler {
            id,
            kind,
            callback,
            filter,
            once,
        });
        tracing::trace!(target: "reqlet::event_bus", handler_id = ?id, ?kind, once, "Handler added");
        id
    }

    pub fn off(&self, id: HandlerId) -> Result<(), EventBusError> {
        let mut handlers = self.shared.handlers();
        let position = handlers
            .iter()
            .position(|handler| handler.id == id)
            .ok_or(EventBusError::HandlerNotFound(id))?;
        handlers.remove(position);
        Ok(())
    }

    pub fn emit(&self, event: ResourceEvent) -> Result<(), EventBusError> {
        let sender = self.sender();
        let Some(tx) = sender.as_ref() else {
            tracing::debug!(target: "reqlet::event_bus", kind = ?event.kind(), "Emit on stopped bus");
            return Err(EventBusError::NotStarted);
        };
        tx.send(event).map_err(|_| EventBusError::NotStarted)
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.shared.handlers().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("started", &self.is_started())
            .field("handlers", &self.handler_count())
            .finish()
    }
}
