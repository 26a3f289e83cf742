use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Buffer, BufferError, SimpleBuffer};
use crate::manager::{BackgroundLoop, Manager, ManagerError, ProposalSource};
use crate::resource::{DEMAND_EXPIRATION, Demand, DemandData, MarketApi, Proposal};

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(30 * 60);
const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RefreshingDemandConfig {
    /// Lifetime of each subscription.
    pub expiration: Duration,
    /// How long before expiry the replacement subscription is opened.
    pub refresh_margin: Duration,
}

impl Default for RefreshingDemandConfig {
    fn default() -> Self {
        let expiration = match std::env::var("REQLET_DEMAND_EXPIRATION_SECS") {
            Err(_) => DEFAULT_EXPIRATION,
            Ok(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    tracing::warn!(target: "reqlet::demand", value = %raw, "Invalid REQLET_DEMAND_EXPIRATION_SECS, using default");
                    DEFAULT_EXPIRATION
                }
            },
        };
        Self {
            expiration,
            refresh_margin: DEFAULT_REFRESH_MARGIN.min(expiration / 2),
        }
    }
}

impl RefreshingDemandConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_refresh_margin(mut self, refresh_margin: Duration) -> Self {
        self.refresh_margin = refresh_margin;
        self
    }

    fn refresh_after(&self) -> Duration {
        self.expiration.saturating_sub(self.refresh_margin)
    }
}

/// Keeps exactly one live demand subscription and funnels its offers into one queue.
///
/// Shortly before the subscription expires, its offers stop being consumed
/// and a replacement is subscribed. A subscription failure is stored in the
/// queue and returned to every consumer once queued offers are used up.
pub struct RefreshingDemandManager {
    market: Arc<dyn MarketApi>,
    demand: DemandData,
    config: RefreshingDemandConfig,
    offers: Arc<SimpleBuffer<Proposal>>,
    background: BackgroundLoop,
}

impl RefreshingDemandManager {
    pub fn new(market: Arc<dyn MarketApi>, demand: DemandData, config: RefreshingDemandConfig) -> Self {
        Self {
            market,
            demand,
            config,
            offers: Arc::new(SimpleBuffer::new()),
            background: BackgroundLoop::new("refreshing demand manager"),
        }
    }

    pub async fn get_initial_proposal(&self) -> Result<Proposal, ManagerError> {
        if !self.background.is_started() {
            return Err(ManagerError::NotStarted("refreshing demand manager"));
        }
        let proposal = self.offers.get().await?;
        tracing::debug!(target: "reqlet::demand", proposal_id = %proposal.id(), "Initial proposal handed out");
        Ok(proposal)
    }

    pub fn initial_source(self: &Arc<Self>) -> ProposalSource {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = Arc::clone(&manager);
            async move { manager.get_initial_proposal().await }.boxed()
        })
    }
}

#[async_trait]
impl Manager for RefreshingDemandManager {
    async fn start(&self) -> Result<(), ManagerError> {
        let market = Arc::clone(&self.market);
        let demand = self.demand.clone();
        let config = self.config.clone();
        let offers = Arc::clone(&self.offers);
        self.offers.reset_error();
        self.background.start(move |token: CancellationToken| {
            subscription_loop(market, demand, config, offers, token)
        })?;
        tracing::info!(target: "reqlet::demand", "Refreshing demand manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.background.stop().await?;
        tracing::info!(target: "reqlet::demand", "Refreshing demand manager stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.background.is_started()
    }
}

struct Subscription {
    demand: Demand,
    consumer: JoinHandle<()>,
}

async fn subscribe(
    market: &dyn MarketApi,
    demand: &DemandData,
    config: &RefreshingDemandConfig,
) -> Result<Demand, ManagerError> {
    let lifetime = chrono::Duration::from_std(config.expiration)
        .map_err(|e| ManagerError::Supply(format!("invalid demand expiration: {e}")))?;
    let expiration = chrono::Utc::now() + lifetime;

    let mut data = demand.clone();
    data.properties.insert(
        DEMAND_EXPIRATION.to_string(),
        Value::from(expiration.timestamp_millis()),
    );
    let subscribed = market.subscribe_demand(&data, expiration).await?;
    tracing::info!(target: "reqlet::demand", demand_id = %subscribed.id(), %expiration, "Demand subscribed");
    Ok(subscribed)
}

async fn consume(demand: Demand, offers: Arc<SimpleBuffer<Proposal>>) {
    while let Some(offer) = demand.next_initial_proposal().await {
        tracing::debug!(target: "reqlet::demand", demand_id = %demand.id(), proposal_id = %offer.id(), "New initial proposal");
        offers.put(offer).await;
    }
    tracing::debug!(target: "reqlet::demand", demand_id = %demand.id(), "Offer stream ended");
}

async fn subscription_loop(
    market: Arc<dyn MarketApi>,
    demand: DemandData,
    config: RefreshingDemandConfig,
    offers: Arc<SimpleBuffer<Proposal>>,
    token: CancellationToken,
) {
    let mut subscriptions: Vec<Subscription> = Vec::new();

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            subscribed = subscribe(market.as_ref(), &demand, &config) => subscribed,
        };
        match subscribed {
            Ok(subscribed) => {
                // The replacement is live, so the superseded demands can go.
                for superseded in subscriptions.drain(..) {
                    retire(superseded).await;
                }
                let consumer = tokio::spawn(consume(subscribed.clone(), Arc::clone(&offers)));
                subscriptions.push(Subscription {
                    demand: subscribed,
                    consumer,
                });
            }
            Err(e) => {
                tracing::error!(target: "reqlet::demand", error = %e, "Demand subscription failed");
                offers.set_error(BufferError::Failed(e.to_string()));
                break;
            }
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(config.refresh_after()) => {}
        }
        tracing::info!(target: "reqlet::demand", "Demand close to expiration, refreshing");
        for subscription in &subscriptions {
            subscription.consumer.abort();
        }
    }

    for subscription in subscriptions {
        retire(subscription).await;
    }
}

async fn retire(subscription: Subscription) {
    subscription.consumer.abort();
    if let Err(e) = subscription.demand.unsubscribe().await {
        tracing::warn!(target: "reqlet::demand", demand_id = %subscription.demand.id(), error = %e, "Failed to unsubscribe demand");
    } else {
        tracing::debug!(target: "reqlet::demand", demand_id = %subscription.demand.id(), "Demand unsubscribed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{DemandNode, Properties, ResourceError};
    use crate::session::Session;
    use crate::testing::{FakeMarket, settle};
    use chrono::{DateTime, Utc};

    fn config() -> RefreshingDemandConfig {
        RefreshingDemandConfig::new()
            .with_expiration(Duration::from_secs(60))
            .with_refresh_margin(Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn refreshes_subscription_before_expiry() {
        let market = FakeMarket::new(Session::new());
        market.set_offer_templates(vec![
            ("provider-a".into(), Properties::new()),
            ("provider-b".into(), Properties::new()),
        ]);
        let manager = RefreshingDemandManager::new(market.clone(), DemandData::default(), config());
        manager.start().await.unwrap();

        assert_eq!(manager.get_initial_proposal().await.unwrap().id(), "demand-0-0");
        assert_eq!(manager.get_initial_proposal().await.unwrap().id(), "demand-0-1");
        let first = market.demands()[0].clone();
        assert!(first.data().properties.contains_key(DEMAND_EXPIRATION));

        tokio::time::sleep(Duration::from_secs(55)).await;
        settle().await;
        assert_eq!(market.demands().len(), 2);
        assert!(first.is_unsubscribed());
        assert!(!market.demands()[1].is_unsubscribed());

        // The superseded demand is no longer consumed.
        first.push(market.proposal("late", "provider-c"));
        assert_eq!(manager.get_initial_proposal().await.unwrap().id(), "demand-1-0");
        settle().await;
        assert_eq!(first.pending_offers(), 1);

        manager.stop().await.unwrap();
        assert!(market.demands().iter().all(|demand| demand.is_unsubscribed()));
        assert_eq!(
            manager.get_initial_proposal().await,
            Err(ManagerError::NotStarted("refreshing demand manager"))
        );
    }

    struct DownMarket;

    #[async_trait]
    impl MarketApi for DownMarket {
        async fn subscribe_demand(
            &self,
            _data: &DemandData,
            _expiration: DateTime<Utc>,
        ) -> Result<Demand, ResourceError> {
            Err(ResourceError::Api("market down".into()))
        }
    }

    #[tokio::test]
    async fn subscription_failure_reaches_every_consumer() {
        let manager = Arc::new(RefreshingDemandManager::new(
            Arc::new(DownMarket),
            DemandData::default(),
            config(),
        ));
        manager.start().await.unwrap();
        let source = manager.initial_source();

        let first = source().await;
        let second = manager.get_initial_proposal().await;
        assert!(matches!(first, Err(ManagerError::Buffer(BufferError::Failed(ref message))) if message.contains("market down")));
        assert_eq!(first, second);
        manager.stop().await.unwrap();
    }
}
