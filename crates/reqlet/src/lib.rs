//! reqlet: requestor-side orchestration engine for decentralized compute marketplaces.
//!
//! Offers flow from a [`demand`] manager through [`proposal`] plugins
//! (filtering, negotiation, buffering, scoring) into an [`agreement`]
//! manager, whose agreements back the [`activity`] managers that
//! [`work`] managers run user work on. The [`pipeline`] stages offer the
//! same flow as composable streams, and [`payment`] settles what the
//! agreements cost.

mod version;

pub mod activity;
pub mod agreement;
pub mod buffer;
pub mod demand;
pub mod event_bus;
pub mod logging;
pub mod manager;
pub mod negotiation;
pub mod payment;
pub mod permit;
pub mod pipeline;
pub mod proposal;
pub mod resource;
pub mod scoring;
pub mod session;
pub mod work;

#[cfg(test)]
mod testing;

pub use activity::{ActivityPool, ActivityPoolManager, SingleUseActivityManager};
pub use agreement::ScoredAheadOfTimeAgreementManager;
pub use demand::{AggregatingDemandManager, RefreshingDemandManager, UnionDemandManager};
pub use event_bus::{EventBus, EventKind, ResourceEvent};
pub use manager::{ActivitySource, AgreementSource, Manager, ManagerError, ProposalSource};
pub use payment::{PayAllPaymentManager, PaymentConfig};
pub use proposal::DefaultProposalManager;
pub use scoring::ProposalScorer;
pub use session::Session;
pub use version::{REQLET_VERSION, VersionInfo};
pub use work::{Work, WorkContext, WorkId, WorkManager, WorkResult};
