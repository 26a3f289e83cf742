//! Offer to draft conversion through an ordered plugin chain.
//!
//! Each [`ProposalManagerPlugin`] receives the source built so far when it is
//! started and returns the source the next plugin (or the caller) pulls from.
//! The chain is composed once at start and never mutated afterwards.

mod buffer;
mod filters;
mod negotiating;

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;

use async_trait::async_trait;
use futures::FutureExt;

use crate::manager::{Manager, ManagerError, ProposalSource, StartedFlag};
use crate::resource::Proposal;

pub use buffer::{
    ProposalBuffer, ProposalBufferConfig, ScoringBuffer, ScoringBufferConfig, reject_expired,
};
pub use filters::{BlacklistProviderIdPlugin, RejectIfCostsExceedsPlugin, WhitelistProviderIdPlugin};
pub use negotiating::NegotiatingPlugin;

#[async_trait]
pub trait ProposalManagerPlugin: Send + Sync {
    /// Start the plugin on top of `upstream` and return the wrapped source.
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError>;

    async fn stop(&self) -> Result<(), ManagerError>;
}

/// Pulls drafts through a plugin chain wrapped around the initial offer source.
pub struct DefaultProposalManager {
    source: ProposalSource,
    plugins: Vec<Arc<dyn ProposalManagerPlugin>>,
    composed: StdMutex<Option<ProposalSource>>,
    started: StartedFlag,
}

impl DefaultProposalManager {
    /// Manager with a single [`NegotiatingPlugin`] without negotiators.
    pub fn new(source: ProposalSource) -> Self {
        Self {
            source,
            plugins: vec![Arc::new(NegotiatingPlugin::default())],
            composed: StdMutex::new(None),
            started: StartedFlag::new("proposal manager"),
        }
    }

    /// Replace the plugin chain. Plugins start in order and stop in reverse.
    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn ProposalManagerPlugin>>) -> Self {
        self.plugins = plugins;
        self
    }

    fn composed(&self) -> MutexGuard<'_, Option<ProposalSource>> {
        match self.composed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!(target: "reqlet::proposal", "Composed source poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Next draft ready for agreement creation. Blocks until one is available.
    pub async fn get_draft_proposal(&self) -> Result<Proposal, ManagerError> {
        let source = self
            .composed()
            .clone()
            .ok_or(ManagerError::NotStarted("proposal manager"))?;
        let proposal = source().await?;
        tracing::debug!(target: "reqlet::proposal", proposal_id = %proposal.id(), "Draft proposal handed out");
        Ok(proposal)
    }

    /// Source handing out drafts, for wiring into an agreement manager.
    pub fn draft_source(self: &Arc<Self>) -> ProposalSource {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = Arc::clone(&manager);
            async move { manager.get_draft_proposal().await }.boxed()
        })
    }

    async fn stop_plugins(plugins: &[Arc<dyn ProposalManagerPlugin>]) -> Result<(), ManagerError> {
        let mut first_error = None;
        for plugin in plugins.iter().rev() {
            if let Err(e) = plugin.stop().await {
                tracing::warn!(target: "reqlet::proposal", error = %e, "Plugin failed to stop");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl Manager for DefaultProposalManager {
    async fn start(&self) -> Result<(), ManagerError> {
        self.started.start()?;

        let mut source = Arc::clone(&self.source);
        for (index, plugin) in self.plugins.iter().enumerate() {
            match plugin.start(source).await {
                Ok(wrapped) => source = wrapped,
                Err(e) => {
                    tracing::error!(target: "reqlet::proposal", plugin = index, error = %e, "Plugin failed to start");
                    let _ = Self::stop_plugins(&self.plugins[..index]).await;
                    let _ = self.started.stop();
                    return Err(e);
                }
            }
        }
        *self.composed() = Some(source);

        tracing::info!(target: "reqlet::proposal", plugins = self.plugins.len(), "Proposal manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.started.stop()?;
        self.composed().take();
        let result = Self::stop_plugins(&self.plugins).await;
        tracing::info!(target: "reqlet::proposal", "Proposal manager stopped");
        result
    }

    fn is_started(&self) -> bool {
        self.started.is_started()
    }
}
