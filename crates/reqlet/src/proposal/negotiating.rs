use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;

use super::ProposalManagerPlugin;
use crate::manager::{ManagerError, ProposalSource};
use crate::negotiation::{NegotiationConfig, Negotiator, negotiate};

/// Negotiates every upstream offer into a draft.
///
/// A rejected or failed branch is dropped and the next upstream offer is
/// negotiated instead. Upstream failures and closed response streams are
/// returned to the caller.
#[derive(Default)]
pub struct NegotiatingPlugin {
    negotiators: Arc<Vec<Arc<dyn Negotiator>>>,
    config: NegotiationConfig,
}

impl NegotiatingPlugin {
    pub fn new(negotiators: Vec<Arc<dyn Negotiator>>) -> Self {
        Self {
            negotiators: Arc::new(negotiators),
            config: NegotiationConfig::default(),
        }
    }

    pub fn with_config(mut self, config: NegotiationConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl ProposalManagerPlugin for NegotiatingPlugin {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        let negotiators = Arc::clone(&self.negotiators);
        let config = self.config.clone();
        Ok(Arc::new(move || {
            let upstream = Arc::clone(&upstream);
            let negotiators = Arc::clone(&negotiators);
            let config = config.clone();
            async move {
                loop {
                    let offer = upstream().await?;
                    match negotiate(offer, &negotiators, &config).await {
                        Ok(draft) => return Ok(draft),
                        Err(ManagerError::Rejected { proposal_id, reason }) => {
                            tracing::debug!(target: "reqlet::proposal", %proposal_id, %reason, "Picking another offer");
                        }
                        Err(ManagerError::Resource(e)) => {
                            tracing::warn!(target: "reqlet::proposal", error = %e, "Negotiation round failed, picking another offer");
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            .boxed()
        }))
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Proposal;
    use crate::session::Session;
    use crate::testing::FakeMarket;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn offers(offers: Vec<Proposal>) -> ProposalSource {
        let queue = Arc::new(Mutex::new(VecDeque::from(offers)));
        Arc::new(move || {
            let next = queue.lock().unwrap().pop_front();
            async move { next.ok_or_else(|| ManagerError::Supply("drained".into())) }.boxed()
        })
    }

    #[tokio::test]
    async fn initial_offers_are_countered_into_drafts() {
        let market = FakeMarket::new(Session::new());
        let plugin = NegotiatingPlugin::default();
        let source = plugin
            .start(offers(vec![market.proposal("p1", "provider-1")]))
            .await
            .unwrap();

        let draft = source().await.unwrap();
        assert_eq!(draft.id(), "p1-draft");
        assert!(draft.is_draft());
        assert_eq!(source().await, Err(ManagerError::Supply("drained".into())));
    }

    #[tokio::test]
    async fn closed_stream_is_not_retried() {
        let market = FakeMarket::new(Session::new());
        market.close_responses("p1");
        let plugin = NegotiatingPlugin::default();
        let source = plugin
            .start(offers(vec![
                market.proposal("p1", "provider-1"),
                market.proposal("p2", "provider-2"),
            ]))
            .await
            .unwrap();

        assert!(matches!(source().await, Err(ManagerError::StreamClosed(_))));
        assert!(market.responses_to("p2").is_empty());
    }
}
