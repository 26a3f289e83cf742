//! Agreement creation from a continuously scored pool of drafts.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::buffer::{Buffer, BufferError, SimpleBuffer};
use crate::event_bus::{EventKind, HandlerId, ResourceEvent};
use crate::manager::{AgreementSource, BackgroundLoop, Manager, ManagerError, ProposalSource};
use crate::resource::{Agreement, Proposal};
use crate::scoring::ProposalScorer;
use crate::session::Session;

const TERMINATION_REASON: &str = "Finished";
const NOT_APPROVED_REASON: &str = "Not approved";
const FAILED_REASON: &str = "Confirmation failed";

type Tracked = DashMap<String, (Agreement, HandlerId)>;

/// Turns the best-scored draft into an approved agreement.
///
/// A background loop keeps pulling drafts from upstream and rescoring the
/// whole pool, so [`get_agreement`](Self::get_agreement) always starts from
/// the best draft seen so far. Drafts that fail to become an agreement are
/// dropped and the next one is tried. Agreements are terminated once their
/// consumer releases them, and on stop.
pub struct ScoredAheadOfTimeAgreementManager {
    session: Arc<Session>,
    draft_source: ProposalSource,
    scorer: ProposalScorer,
    scored: Arc<SimpleBuffer<Proposal>>,
    agreements: Arc<Tracked>,
    background: BackgroundLoop,
}

impl ScoredAheadOfTimeAgreementManager {
    pub fn new(session: Arc<Session>, draft_source: ProposalSource, scorer: ProposalScorer) -> Self {
        Self {
            session,
            draft_source,
            scorer,
            scored: Arc::new(SimpleBuffer::new()),
            agreements: Arc::new(DashMap::new()),
            background: BackgroundLoop::new("agreement manager"),
        }
    }

    /// Number of scored drafts waiting to be turned into agreements.
    pub fn pending_drafts(&self) -> usize {
        self.scored.size()
    }

    pub async fn get_agreement(&self) -> Result<Agreement, ManagerError> {
        if !self.background.is_started() {
            return Err(ManagerError::NotStarted("agreement manager"));
        }
        loop {
            let proposal = self.scored.get().await?;
            match agree(&proposal).await {
                Ok(agreement) => {
                    self.track(&agreement);
                    tracing::info!(target: "reqlet::agreement", agreement_id = %agreement.id(), proposal_id = %proposal.id(), "Agreement created");
                    return Ok(agreement);
                }
                Err(e) => {
                    tracing::debug!(target: "reqlet::agreement", proposal_id = %proposal.id(), error = %e, "Creating agreement failed, retrying");
                }
            }
        }
    }

    pub fn agreement_source(self: &Arc<Self>) -> AgreementSource {
        let manager = Arc::clone(self);
        Arc::new(move || {
            let manager = Arc::clone(&manager);
            async move { manager.get_agreement().await }.boxed()
        })
    }

    /// Terminate the agreement as soon as its consumer releases it.
    fn track(&self, agreement: &Agreement) {
        let agreements = Arc::clone(&self.agreements);
        let id = agreement.id().to_string();
        let handler = self.session.event_bus().on_once(
            EventKind::AgreementReleased,
            Arc::new(move |event: ResourceEvent| {
                let agreements = Arc::clone(&agreements);
                async move {
                    let ResourceEvent::AgreementReleased(agreement) = event else {
                        return Ok(());
                    };
                    agreements.remove(agreement.id());
                    agreement.terminate(TERMINATION_REASON).await?;
                    tracing::info!(target: "reqlet::agreement", agreement_id = %agreement.id(), "Agreement closed");
                    Ok::<(), anyhow::Error>(())
                }
                .boxed()
            }),
            Some(Arc::new(move |event: &ResourceEvent| event.resource_id() == id)),
        );
        self.agreements
            .insert(agreement.id().to_string(), (agreement.clone(), handler));
    }
}

/// Create, confirm and await approval. An agreement that gets created but
/// never approved is terminated before the error is returned.
async fn agree(proposal: &Proposal) -> Result<Agreement, ManagerError> {
    let agreement = proposal.create_agreement().await?;
    if let Err(e) = confirm_and_approve(&agreement).await {
        let reason = match e {
            ManagerError::NotApproved(_) => NOT_APPROVED_REASON,
            _ => FAILED_REASON,
        };
        if let Err(terminate_error) = agreement.terminate(reason).await {
            tracing::warn!(target: "reqlet::agreement", agreement_id = %agreement.id(), error = %terminate_error, "Failed to terminate unapproved agreement");
        }
        return Err(e);
    }
    Ok(agreement)
}

async fn confirm_and_approve(agreement: &Agreement) -> Result<(), ManagerError> {
    agreement.confirm().await?;
    if !agreement.wait_for_approval().await? {
        return Err(ManagerError::NotApproved(agreement.id().to_string()));
    }
    Ok(())
}

async fn scoring_loop(
    source: ProposalSource,
    scored: Arc<SimpleBuffer<Proposal>>,
    scorer: ProposalScorer,
    token: CancellationToken,
) {
    loop {
        let draft = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            draft = source() => draft,
        };
        let draft = match draft {
            Ok(draft) => draft,
            Err(e) => {
                tracing::error!(target: "reqlet::agreement", error = %e, "Draft supply failed, scoring stopped");
                scored.set_error(BufferError::Failed(e.to_string()));
                return;
            }
        };

        let mut proposals = scored.get_all().await;
        proposals.push(draft);
        let ranked = scorer.rank(proposals).await;
        tracing::debug!(
            target: "reqlet::agreement",
            total = ranked.len(),
            best = ranked.first().map(|(score, _)| *score),
            "Drafts rescored"
        );
        scored
            .put_all(ranked.into_iter().map(|(_, proposal)| proposal).collect())
            .await;
    }
}

#[async_trait]
impl Manager for ScoredAheadOfTimeAgreementManager {
    async fn start(&self) -> Result<(), ManagerError> {
        let source = Arc::clone(&self.draft_source);
        let scored = Arc::clone(&self.scored);
        let scorer = self.scorer.clone();
        self.scored.reset_error();
        self.background
            .start(move |token: CancellationToken| scoring_loop(source, scored, scorer, token))?;
        tracing::info!(target: "reqlet::agreement", "Agreement manager started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.background.stop().await?;
        self.scored.get_all().await;

        let open: Vec<String> = self.agreements.iter().map(|entry| entry.key().clone()).collect();
        let mut closing = Vec::with_capacity(open.len());
        for id in open {
            let Some((_, (agreement, handler))) = self.agreements.remove(&id) else {
                continue;
            };
            // Already gone if the release handler fired in the meantime.
            let _ = self.session.event_bus().off(handler);
            closing.push(async move {
                if let Err(e) = agreement.terminate(TERMINATION_REASON).await {
                    tracing::warn!(target: "reqlet::agreement", agreement_id = %agreement.id(), error = %e, "Failed to terminate agreement");
                }
            });
        }
        let terminated = closing.len();
        futures::future::join_all(closing).await;

        tracing::info!(target: "reqlet::agreement", terminated, "Agreement manager stopped");
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.background.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Properties, ProposalData};
    use crate::scoring::{MapScore, Pricing};
    use crate::testing::{FakeMarket, settle};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    fn priced(market: &FakeMarket, id: &str, issuer: &str, price: f64) -> Proposal {
        let mut properties = Properties::new();
        properties.insert("price".into(), json!(price));
        market.draft(id, issuer, properties)
    }

    /// Hands out `drafts` in order, then never resolves.
    fn queued(drafts: Vec<Proposal>) -> ProposalSource {
        let queue = Arc::new(StdMutex::new(VecDeque::from(drafts)));
        Arc::new(move || match queue.lock().unwrap().pop_front() {
            Some(draft) => async move { Ok::<_, ManagerError>(draft) }.boxed(),
            None => futures::future::pending::<Result<Proposal, ManagerError>>().boxed(),
        })
    }

    fn cheapest_first() -> ProposalScorer {
        let pricing: Arc<dyn Pricing> = Arc::new(|data: &ProposalData| data.property_f64("price"));
        ProposalScorer::default().with_scorer(
            1.0,
            Arc::new(MapScore::new(pricing).with_normalize(true).with_normalize_flip(true)),
        )
    }

    #[tokio::test]
    async fn best_draft_wins_and_failures_are_skipped() {
        let session = Session::new();
        session.start().await.unwrap();
        let market = FakeMarket::new(Arc::clone(&session));
        market.fail_confirm("refusing");
        market.deny_approval("unapproving");
        let source = queued(vec![
            priced(&market, "pricey", "good", 9.0),
            priced(&market, "mid", "good", 5.0),
            priced(&market, "cheapest", "refusing", 1.0),
            priced(&market, "cheap", "unapproving", 2.0),
        ]);

        let manager = ScoredAheadOfTimeAgreementManager::new(Arc::clone(&session), source, cheapest_first());
        manager.start().await.unwrap();
        settle().await;
        assert_eq!(manager.pending_drafts(), 4);

        let agreement = manager.get_agreement().await.unwrap();
        assert_eq!(agreement.proposal().id(), "mid");
        // The unapproved agreement was confirmed too, and both failures were terminated.
        let confirmed = market.confirmed();
        assert_eq!(confirmed.len(), 2);
        assert_eq!(confirmed.last(), Some(&agreement.id().to_string()));
        let terminated = market.terminated();
        assert_eq!(terminated.len(), 2);
        assert!(!terminated.contains(&agreement.id().to_string()));
        assert_eq!(manager.pending_drafts(), 1);

        manager.stop().await.unwrap();
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn released_agreement_is_terminated() {
        let session = Session::new();
        session.start().await.unwrap();
        let market = FakeMarket::new(Arc::clone(&session));
        let source = queued(vec![priced(&market, "only", "good", 1.0)]);

        let manager = Arc::new(ScoredAheadOfTimeAgreementManager::new(
            Arc::clone(&session),
            source,
            cheapest_first(),
        ));
        manager.start().await.unwrap();
        let agreement = manager.agreement_source()().await.unwrap();
        assert!(market.terminated().is_empty());

        agreement.release().await.unwrap();
        settle().await;
        assert_eq!(market.terminated(), vec![agreement.id().to_string()]);

        // Nothing left to terminate on stop.
        manager.stop().await.unwrap();
        assert_eq!(market.terminated().len(), 1);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_terminates_unreleased_agreements() {
        let session = Session::new();
        session.start().await.unwrap();
        let market = FakeMarket::new(Arc::clone(&session));
        let source = queued(vec![priced(&market, "only", "good", 1.0)]);

        let manager = ScoredAheadOfTimeAgreementManager::new(Arc::clone(&session), source, cheapest_first());
        manager.start().await.unwrap();
        let agreement = manager.get_agreement().await.unwrap();
        manager.stop().await.unwrap();

        assert_eq!(market.terminated(), vec![agreement.id().to_string()]);
        assert_eq!(session.event_bus().handler_count(), 0);
        assert_eq!(
            manager.get_agreement().await,
            Err(ManagerError::NotStarted("agreement manager"))
        );
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn supply_failure_surfaces_after_queued_drafts() {
        let session = Session::new();
        let market = FakeMarket::new(Arc::clone(&session));
        let draft = priced(&market, "only", "good", 1.0);
        let handed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let source: ProposalSource = Arc::new(move || {
            let draft = draft.clone();
            let first = !handed.swap(true, std::sync::atomic::Ordering::SeqCst);
            async move {
                if first {
                    Ok(draft)
                } else {
                    Err(ManagerError::Supply("market closed".into()))
                }
            }
            .boxed()
        });

        let manager = ScoredAheadOfTimeAgreementManager::new(Arc::clone(&session), source, cheapest_first());
        manager.start().await.unwrap();
        settle().await;

        assert!(manager.get_agreement().await.is_ok());
        assert!(matches!(
            manager.get_agreement().await,
            Err(ManagerError::Buffer(BufferError::Failed(ref message))) if message.contains("market closed")
        ));
        manager.stop().await.unwrap();
    }
}
