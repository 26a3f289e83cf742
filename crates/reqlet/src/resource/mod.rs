//! Handles to resources owned by the network-facing collaborator layer.
//!
//! The engine never talks to the daemon directly. Everything it needs is
//! expressed through the node traits below; [`Demand`], [`Proposal`],
//! [`Agreement`], [`Activity`] and the payment handles are cheap cloneable
//! handles around them that compare by id.

mod data;
mod registry;

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use data::*;
pub use registry::ResourceRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Demand,
    Proposal,
    Agreement,
    Activity,
    Batch,
    Allocation,
    Invoice,
    DebitNote,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("{kind:?} `{id}` not found")]
    NotFound { kind: ResourceKind, id: String },
    #[error("{kind:?} `{id}` is registered with a different type")]
    TypeMismatch { kind: ResourceKind, id: String },
    #[error("Market request failed: {0}")]
    Api(String),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Batch failed: {0}")]
    BatchFailed(String),
}

#[async_trait]
pub trait DemandNode: Send + Sync {
    fn id(&self) -> &str;

    fn data(&self) -> DemandData;

    fn expiration(&self) -> DateTime<Utc>;

    /// Next offer received for this demand. `None` once unsubscribed.
    async fn next_initial_proposal(&self) -> Option<Proposal>;

    async fn unsubscribe(&self) -> Result<(), ResourceError>;
}

#[async_trait]
pub trait ProposalNode: Send + Sync {
    fn id(&self) -> &str;

    /// Latest known snapshot.
    fn data(&self) -> ProposalData;

    fn demand(&self) -> Demand;

    /// Send a counter-proposal. The returned node is our own proposal; the
    /// provider's answer arrives through [`next_response`](Self::next_response).
    async fn respond(&self, data: &DemandData) -> Result<Proposal, ResourceError>;

    /// Next counter-offer to one of our responses. `None` when the stream closed.
    async fn next_response(&self) -> Option<Proposal>;

    async fn reject(&self, reason: &str) -> Result<(), ResourceError>;

    async fn create_agreement(&self) -> Result<Agreement, ResourceError>;
}

#[async_trait]
pub trait AgreementNode: Send + Sync {
    fn id(&self) -> &str;

    fn proposal(&self) -> Proposal;

    async fn confirm(&self) -> Result<(), ResourceError>;

    /// Whether the provider approved the agreement.
    async fn wait_for_approval(&self) -> Result<bool, ResourceError>;

    async fn create_activity(&self) -> Result<Activity, ResourceError>;

    async fn terminate(&self, reason: &str) -> Result<(), ResourceError>;

    /// Mark the agreement as no longer used by its consumer.
    async fn release(&self) -> Result<(), ResourceError>;
}

#[async_trait]
pub trait BatchNode: Send + Sync {
    fn id(&self) -> &str;

    /// Wait for every command to finish.
    async fn wait(&self, timeout: Option<Duration>) -> Result<Vec<BatchEvent>, ResourceError>;
}

#[async_trait]
pub trait ActivityNode: Send + Sync {
    fn id(&self) -> &str;

    fn agreement(&self) -> Agreement;

    fn is_destroyed(&self) -> bool;

    async fn execute(&self, script: Vec<Command>) -> Result<Arc<dyn BatchNode>, ResourceError>;

    async fn destroy(&self) -> Result<(), ResourceError>;
}

#[async_trait]
pub trait MarketApi: Send + Sync {
    /// Publish a demand and start receiving offers for it.
    async fn subscribe_demand(
        &self,
        data: &DemandData,
        expiration: DateTime<Utc>,
    ) -> Result<Demand, ResourceError>;
}

#[async_trait]
pub trait AllocationNode: Send + Sync {
    fn id(&self) -> &str;

    /// Return the unspent budget.
    async fn release(&self) -> Result<(), ResourceError>;
}

/// Invoice or debit note.
#[async_trait]
pub trait PaymentDocumentNode: Send + Sync {
    fn id(&self) -> &str;

    fn data(&self) -> PaymentDocumentData;

    /// Accept `amount` of the document, paid from `allocation`.
    async fn accept(&self, allocation: &Allocation, amount: &str) -> Result<(), ResourceError>;
}

#[async_trait]
pub trait PaymentApi: Send + Sync {
    /// Reserve `budget` on the given payment network and driver.
    async fn create_allocation(
        &self,
        budget: f64,
        network: &str,
        driver: &str,
    ) -> Result<Allocation, ResourceError>;
}

macro_rules! resource_handle {
    ($(#[$meta:meta])* $name:ident, $node:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name(Arc<dyn $node>);

        impl $name {
            pub fn new(node: Arc<dyn $node>) -> Self {
                Self(node)
            }
        }

        impl Deref for $name {
            type Target = dyn $node;

            fn deref(&self) -> &Self::Target {
                self.0.as_ref()
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                self.0.id() == other.0.id()
            }
        }

        impl Eq for $name {}

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0.id())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.0.id())
            }
        }
    };
}

resource_handle!(
    /// A published demand, root of one negotiation tree.
    Demand,
    DemandNode
);
resource_handle!(
    /// One node in a negotiation tree.
    Proposal,
    ProposalNode
);
resource_handle!(Agreement, AgreementNode);
resource_handle!(
    /// A leased execution context.
    Activity,
    ActivityNode
);

resource_handle!(
    /// Budget reserved for paying providers.
    Allocation,
    AllocationNode
);
resource_handle!(Invoice, PaymentDocumentNode);
resource_handle!(
    /// Interim payment request for an ongoing agreement.
    DebitNote,
    PaymentDocumentNode
);

impl Invoice {
    pub async fn accept_full(&self, allocation: &Allocation) -> Result<(), ResourceError> {
        let amount = self.data().amount;
        self.accept(allocation, &amount).await
    }
}

impl DebitNote {
    pub async fn accept_full(&self, allocation: &Allocation) -> Result<(), ResourceError> {
        let amount = self.data().amount;
        self.accept(allocation, &amount).await
    }
}

impl Proposal {
    pub fn is_initial(&self) -> bool {
        self.data().is_initial()
    }

    pub fn is_draft(&self) -> bool {
        self.data().is_draft()
    }
}

impl Activity {
    /// Execute a script and wait for it to finish, failing on the first unsuccessful command.
    pub async fn run_script(
        &self,
        script: Vec<Command>,
        timeout: Option<Duration>,
    ) -> Result<Vec<BatchEvent>, ResourceError> {
        let batch = self.execute(script).await?;
        let events = batch.wait(timeout).await?;
        if let Some(failed) = events.iter().find(|event| !event.success) {
            return Err(ResourceError::BatchFailed(
                failed
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("command {} failed", failed.index)),
            ));
        }
        Ok(events)
    }
}
