//! Paying providers for agreements made in the session.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use futures::FutureExt;
use tokio::sync::{Mutex, Notify};

use crate::event_bus::{EventCallback, EventFilter, EventKind, HandlerId, ResourceEvent};
use crate::manager::{Manager, ManagerError, StartedFlag};
use crate::resource::{Allocation, DebitNote, Invoice, PaymentApi, ResourceKind};
use crate::session::Session;

pub const DEFAULT_PAYMENT_NETWORK: &str = "holesky";
pub const DEFAULT_PAYMENT_DRIVER: &str = "erc20";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(150);

#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// Amount reserved for the whole session.
    pub budget: f64,
    pub network: String,
    pub driver: String,
    /// How long [`stop`](Manager::stop) waits for outstanding invoices.
    pub shutdown_timeout: Duration,
}

impl PaymentConfig {
    /// Network and driver default to `REQLET_PAYMENT_NETWORK` and
    /// `REQLET_PAYMENT_DRIVER`, or [`DEFAULT_PAYMENT_NETWORK`] and [`DEFAULT_PAYMENT_DRIVER`].
    pub fn new(budget: f64) -> Self {
        Self {
            budget,
            network: std::env::var("REQLET_PAYMENT_NETWORK")
                .unwrap_or_else(|_| DEFAULT_PAYMENT_NETWORK.to_string()),
            driver: std::env::var("REQLET_PAYMENT_DRIVER")
                .unwrap_or_else(|_| DEFAULT_PAYMENT_DRIVER.to_string()),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_network(mut self, network: impl Into<String>) -> Self {
        self.network = network.into();
        self
    }

    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

/// Allocation plus the agreements still owing an invoice.
struct Ledger {
    api: Arc<dyn PaymentApi>,
    config: PaymentConfig,
    allocation: Mutex<Option<Allocation>>,
    unpaid: DashSet<String>,
    paid: Notify,
}

impl Ledger {
    /// The session allocation, created on first use.
    async fn allocation(&self) -> Result<Allocation, ManagerError> {
        let mut slot = self.allocation.lock().await;
        if let Some(allocation) = slot.as_ref() {
            return Ok(allocation.clone());
        }
        let config = &self.config;
        let allocation = self
            .api
            .create_allocation(config.budget, &config.network, &config.driver)
            .await?;
        tracing::info!(
            target: "reqlet::payment",
            allocation_id = %allocation.id(),
            budget = config.budget,
            network = %config.network,
            driver = %config.driver,
            "Allocation created"
        );
        *slot = Some(allocation.clone());
        Ok(allocation)
    }

    async fn pay_invoice(&self, invoice: Invoice) -> anyhow::Result<()> {
        let data = invoice.data();
        if !self.unpaid.contains(&data.agreement_id) {
            tracing::debug!(target: "reqlet::payment", invoice_id = %invoice.id(), agreement_id = %data.agreement_id, "Invoice for an unknown agreement, ignoring");
            return Ok(());
        }
        let allocation = self.allocation().await?;
        invoice.accept(&allocation, &data.amount).await?;
        self.unpaid.remove(&data.agreement_id);
        self.paid.notify_waiters();
        tracing::info!(target: "reqlet::payment", invoice_id = %invoice.id(), agreement_id = %data.agreement_id, amount = %data.amount, "Invoice accepted");
        Ok(())
    }

    async fn pay_debit_note(&self, debit_note: DebitNote) -> anyhow::Result<()> {
        let data = debit_note.data();
        if !self.unpaid.contains(&data.agreement_id) {
            tracing::debug!(target: "reqlet::payment", debit_note_id = %debit_note.id(), agreement_id = %data.agreement_id, "Debit note for an unknown or settled agreement, ignoring");
            return Ok(());
        }
        let allocation = self.allocation().await?;
        debit_note.accept(&allocation, &data.amount).await?;
        tracing::info!(target: "reqlet::payment", debit_note_id = %debit_note.id(), agreement_id = %data.agreement_id, amount = %data.amount, "Debit note accepted");
        Ok(())
    }

    async fn wait_until_paid(&self) {
        loop {
            let paid = self.paid.notified();
            tokio::pin!(paid);
            paid.as_mut().enable();
            if self.unpaid.is_empty() {
                return;
            }
            paid.await;
        }
    }
}

/// Accepts every invoice and debit note for agreements created in the session.
///
/// The allocation is created on the first payment and released on stop.
/// Stopping waits up to the shutdown timeout for agreements whose invoice
/// has not arrived yet.
pub struct PayAllPaymentManager {
    session: Arc<Session>,
    ledger: Arc<Ledger>,
    handlers: StdMutex<Vec<HandlerId>>,
    started: StartedFlag,
}

impl PayAllPaymentManager {
    pub fn new(session: Arc<Session>, api: Arc<dyn PaymentApi>, config: PaymentConfig) -> Self {
        Self {
            session,
            ledger: Arc::new(Ledger {
                api,
                config,
                allocation: Mutex::new(None),
                unpaid: DashSet::new(),
                paid: Notify::new(),
            }),
            handlers: StdMutex::new(Vec::new()),
            started: StartedFlag::new("payment manager"),
        }
    }

    pub async fn get_allocation(&self) -> Result<Allocation, ManagerError> {
        if !self.started.is_started() {
            return Err(ManagerError::NotStarted("payment manager"));
        }
        self.ledger.allocation().await
    }

    /// Agreements made since start whose invoice has not been accepted.
    pub fn unpaid_agreements(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.ledger.unpaid.iter().map(|id| id.key().clone()).collect();
        ids.sort();
        ids
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<HandlerId>> {
        match self.handlers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::payment", "Handler list poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn on(&self, kind: EventKind, callback: EventCallback, filter: Option<EventFilter>) {
        let id = self.session.event_bus().on(kind, callback, filter);
        self.handlers().push(id);
    }
}

#[async_trait]
impl Manager for PayAllPaymentManager {
    async fn start(&self) -> Result<(), ManagerError> {
        self.started.start()?;

        let ledger = Arc::clone(&self.ledger);
        self.on(
            EventKind::NewResource,
            Arc::new(move |event: ResourceEvent| {
                if let ResourceEvent::NewResource { id, .. } = event {
                    tracing::debug!(target: "reqlet::payment", agreement_id = %id, "Expecting an invoice");
                    ledger.unpaid.insert(id);
                }
                async { Ok::<(), anyhow::Error>(()) }.boxed()
            }),
            Some(Arc::new(|event: &ResourceEvent| {
                matches!(event, ResourceEvent::NewResource { kind: ResourceKind::Agreement, .. })
            })),
        );

        let ledger = Arc::clone(&self.ledger);
        self.on(
            EventKind::InvoiceReceived,
            Arc::new(move |event: ResourceEvent| {
                let ledger = Arc::clone(&ledger);
                async move {
                    match event {
                        ResourceEvent::InvoiceReceived(invoice) => ledger.pay_invoice(invoice).await,
                        _ => Ok(()),
                    }
                }
                .boxed()
            }),
            None,
        );

        let ledger = Arc::clone(&self.ledger);
        self.on(
            EventKind::DebitNoteReceived,
            Arc::new(move |event: ResourceEvent| {
                let ledger = Arc::clone(&ledger);
                async move {
                    match event {
                        ResourceEvent::DebitNoteReceived(debit_note) => {
                            ledger.pay_debit_note(debit_note).await
                        }
                        _ => Ok(()),
                    }
                }
                .boxed()
            }),
            None,
        );

        tracing::info!(target: "reqlet::payment", "Payment manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.started.stop()?;

        let timeout = self.ledger.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.ledger.wait_until_paid()).await.is_err() {
            tracing::error!(
                target: "reqlet::payment",
                agreements = ?self.unpaid_agreements(),
                ?timeout,
                "Invoices not received before shutdown"
            );
        }

        let handlers: Vec<HandlerId> = self.handlers().drain(..).collect();
        for handler in handlers {
            let _ = self.session.event_bus().off(handler);
        }

        if let Some(allocation) = self.ledger.allocation.lock().await.take() {
            match allocation.release().await {
                Ok(()) => tracing::info!(target: "reqlet::payment", allocation_id = %allocation.id(), "Allocation released"),
                Err(e) => tracing::warn!(target: "reqlet::payment", allocation_id = %allocation.id(), error = %e, "Failed to release allocation"),
            }
        }
        self.ledger.unpaid.clear();
        tracing::info!(target: "reqlet::payment", "Payment manager stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started.is_started()
    }
}
