use std::sync::Arc;

use crate::event_bus::{EventBus, EventBusError, ResourceEvent};
use crate::resource::{
    Activity, ActivityNode, Agreement, AgreementNode, Allocation, AllocationNode, DebitNote,
    Demand, DemandNode, Invoice, PaymentDocumentNode, Proposal, ProposalNode, ResourceError,
    ResourceKind, ResourceRegistry,
};
use crate::version::VersionInfo;

/// Top-level owner of resource identity and change notification.
///
/// Resources registered through a session are unique per id: registering a
/// node whose id is already known returns the existing handle.
#[derive(Debug, Default)]
pub struct Session {
    registry: ResourceRegistry,
    event_bus: Arc<EventBus>,
    version: VersionInfo,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A session reporting `version` when it starts.
    pub fn with_version(version: VersionInfo) -> Arc<Self> {
        Arc::new(Self {
            version,
            ..Self::default()
        })
    }

    pub fn version(&self) -> &VersionInfo {
        &self.version
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub async fn start(&self) -> Result<(), EventBusError> {
        self.event_bus.start().await?;
        tracing::info!(target: "reqlet::session", version = %self.version, "Session started");
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), EventBusError> {
        self.event_bus.stop().await
    }

    pub fn emit(&self, event: ResourceEvent) {
        if let Err(e) = self.event_bus.emit(event) {
            tracing::debug!(target: "reqlet::session", error = %e, "Event dropped");
        }
    }

    fn register<R, F>(&self, kind: ResourceKind, id: &str, make: F) -> Result<R, ResourceError>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce() -> R,
    {
        self.register_new(kind, id, make).map(|(resource, _)| resource)
    }

    /// Like `register`, also telling whether the resource was new.
    fn register_new<R, F>(&self, kind: ResourceKind, id: &str, make: F) -> Result<(R, bool), ResourceError>
    where
        R: Clone + Send + Sync + 'static,
        F: FnOnce() -> R,
    {
        let mut created = false;
        let resource = self.registry.get_or_insert_with(kind, id, || {
            created = true;
            make()
        })?;
        if created {
            self.emit(ResourceEvent::NewResource {
                kind,
                id: id.to_string(),
            });
        }
        Ok((resource, created))
    }

    pub fn demand(&self, node: Arc<dyn DemandNode>) -> Result<Demand, ResourceError> {
        let id = node.id().to_string();
        self.register(ResourceKind::Demand, &id, || Demand::new(node))
    }

    pub fn proposal(&self, node: Arc<dyn ProposalNode>) -> Result<Proposal, ResourceError> {
        let id = node.id().to_string();
        self.register(ResourceKind::Proposal, &id, || Proposal::new(node))
    }

    pub fn agreement(&self, node: Arc<dyn AgreementNode>) -> Result<Agreement, ResourceError> {
        let id = node.id().to_string();
        self.register(ResourceKind::Agreement, &id, || Agreement::new(node))
    }

    pub fn activity(&self, node: Arc<dyn ActivityNode>) -> Result<Activity, ResourceError> {
        let id = node.id().to_string();
        self.register(ResourceKind::Activity, &id, || Activity::new(node))
    }

    pub fn allocation(&self, node: Arc<dyn AllocationNode>) -> Result<Allocation, ResourceError> {
        let id = node.id().to_string();
        self.register(ResourceKind::Allocation, &id, || Allocation::new(node))
    }

    /// Register an invoice, announcing it with [`ResourceEvent::InvoiceReceived`] the first time.
    pub fn invoice(&self, node: Arc<dyn PaymentDocumentNode>) -> Result<Invoice, ResourceError> {
        let id = node.id().to_string();
        let (invoice, created) = self.register_new(ResourceKind::Invoice, &id, || Invoice::new(node))?;
        if created {
            self.emit(ResourceEvent::InvoiceReceived(invoice.clone()));
        }
        Ok(invoice)
    }

    /// Register a debit note, announcing it with [`ResourceEvent::DebitNoteReceived`] the first time.
    pub fn debit_note(&self, node: Arc<dyn PaymentDocumentNode>) -> Result<DebitNote, ResourceError> {
        let id = node.id().to_string();
        let (debit_note, created) =
            self.register_new(ResourceKind::DebitNote, &id, || DebitNote::new(node))?;
        if created {
            self.emit(ResourceEvent::DebitNoteReceived(debit_note.clone()));
        }
        Ok(debit_note)
    }
}
