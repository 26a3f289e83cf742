use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use super::ProposalManagerPlugin;
use crate::buffer::{
    BackgroundFillBuffer, Buffer, BufferError, ExpirableBuffer, ExpirationFn, ExpiredFn, FillFn,
    SimpleBuffer,
};
use crate::manager::{BackgroundLoop, ManagerError, ProposalSource};
use crate::resource::Proposal;
use crate::scoring::ProposalScorer;

const DEFAULT_SCORING_DEBOUNCE: Duration = Duration::from_secs(10);
const EXPIRED_REASON: &str = "Proposal no longer needed due to its near expiration.";

#[derive(Debug, Clone)]
pub struct ProposalBufferConfig {
    /// Refill once fewer proposals than this are buffered.
    pub min_size: usize,
    /// Target for buffered plus requested proposals.
    pub max_size: usize,
    pub fill_concurrency: usize,
    /// Request `max_size` proposals right at start instead of on first use.
    pub fill_at_start: bool,
}

impl ProposalBufferConfig {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size: max_size.max(1),
            fill_concurrency: 1,
            fill_at_start: false,
        }
    }

    pub fn with_fill_concurrency(mut self, fill_concurrency: usize) -> Self {
        self.fill_concurrency = fill_concurrency.max(1);
        self
    }

    pub fn with_fill_at_start(mut self, fill_at_start: bool) -> Self {
        self.fill_at_start = fill_at_start;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ScoringBufferConfig {
    pub buffer: ProposalBufferConfig,
    /// How long to keep collecting requested proposals before rescoring.
    pub scoring_debounce: Duration,
}

impl ScoringBufferConfig {
    /// Debounce defaults to `REQLET_SCORING_DEBOUNCE_MS`, or 10 seconds.
    pub fn new(buffer: ProposalBufferConfig) -> Self {
        Self {
            buffer,
            scoring_debounce: debounce_from_env(),
        }
    }

    pub fn with_scoring_debounce(mut self, scoring_debounce: Duration) -> Self {
        self.scoring_debounce = scoring_debounce;
        self
    }
}

fn debounce_from_env() -> Duration {
    let Ok(raw) = std::env::var("REQLET_SCORING_DEBOUNCE_MS") else {
        return DEFAULT_SCORING_DEBOUNCE;
    };
    match raw.parse::<u64>() {
        Ok(millis) => Duration::from_millis(millis),
        Err(e) => {
            tracing::warn!(target: "reqlet::proposal", value = %raw, error = %e, "Invalid REQLET_SCORING_DEBOUNCE_MS, using default");
            DEFAULT_SCORING_DEBOUNCE
        }
    }
}

type DynBuffer = Arc<dyn Buffer<Proposal>>;
type ProposalFill = BackgroundFillBuffer<Proposal, DynBuffer>;

struct Scoring {
    scorer: ProposalScorer,
    debounce: Duration,
    background: BackgroundLoop,
}

/// State of one started buffer plugin.
struct Running {
    config: ProposalBufferConfig,
    fill: Arc<ProposalFill>,
    /// Where consumers take proposals from: the fill buffer itself, or the
    /// scored buffer when scoring.
    ready: DynBuffer,
    scoring: Option<Scoring>,
    getters: Semaphore,
}

impl Running {
    fn build(
        config: ProposalBufferConfig,
        upstream: ProposalSource,
        expiration: Option<(ExpirationFn<Proposal>, ExpiredFn<Proposal>)>,
        scoring: Option<(ProposalScorer, Duration)>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Running>| {
            // Expiry applies to whichever buffer consumers read from.
            let expiring = || -> DynBuffer {
                match &expiration {
                    Some((expiration, hook)) => Arc::new(
                        ExpirableBuffer::new(SimpleBuffer::new(), Arc::clone(expiration))
                            .with_on_expired(on_expired(me.clone(), Arc::clone(hook))),
                    ),
                    None => Arc::new(SimpleBuffer::new()),
                }
            };

            let fill_inner: DynBuffer = if scoring.is_some() {
                Arc::new(SimpleBuffer::new())
            } else {
                expiring()
            };
            let fill = Arc::new(BackgroundFillBuffer::new(
                fill_inner,
                fill_from(upstream),
                config.fill_concurrency,
            ));
            let ready: DynBuffer = if scoring.is_some() {
                expiring()
            } else {
                Arc::clone(&fill) as DynBuffer
            };

            Self {
                getters: Semaphore::new(config.max_size),
                config,
                fill,
                ready,
                scoring: scoring.map(|(scorer, debounce)| Scoring {
                    scorer,
                    debounce,
                    background: BackgroundLoop::new("scoring buffer"),
                }),
            }
        })
    }

    async fn start(&self) -> Result<(), ManagerError> {
        self.fill.start().await?;
        if let Some(scoring) = &self.scoring {
            let fill = Arc::clone(&self.fill);
            let scored = Arc::clone(&self.ready);
            let scorer = scoring.scorer.clone();
            let debounce = scoring.debounce;
            scoring.background.start(move |token: CancellationToken| {
                scoring_loop(fill, scored, scorer, debounce, token)
            })?;
        }
        if self.config.fill_at_start {
            self.request_fill();
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        self.getters.close();
        if let Some(scoring) = &self.scoring {
            scoring.background.stop().await?;
        }
        self.fill.stop().await?;
        self.ready
            .set_error(BufferError::Failed("proposal buffer stopped".to_string()));
        Ok(())
    }

    /// Proposals ready or waiting to be scored.
    fn count(&self) -> usize {
        match self.scoring {
            Some(_) => self.fill.size() + self.ready.size(),
            None => self.ready.size(),
        }
    }

    fn count_with_requested(&self) -> usize {
        match self.scoring {
            Some(_) => self.fill.size_with_requested() + self.ready.size(),
            None => self.fill.size_with_requested(),
        }
    }

    /// Top the buffer up to `max_size`, counting proposals already requested.
    fn request_fill(&self) {
        let missing = self
            .config
            .max_size
            .saturating_sub(self.count_with_requested());
        tracing::debug!(
            target: "reqlet::proposal",
            buffered = self.count(),
            requested = self.count_with_requested() - self.count(),
            missing,
            target_size = self.config.max_size,
            "Requesting proposals"
        );
        if missing > 0 {
            self.fill.request(missing);
        }
    }

    async fn get(&self) -> Result<Proposal, ManagerError> {
        let _getter = self
            .getters
            .acquire()
            .await
            .map_err(|_| ManagerError::NotStarted("proposal buffer"))?;

        if self.count() == 0 {
            tracing::debug!(target: "reqlet::proposal", "No buffered proposals, requesting fill");
            self.request_fill();
        }

        let proposal = self.ready.get().await?;

        let count = self.count();
        if count < self.config.min_size {
            tracing::debug!(target: "reqlet::proposal", count, min_size = self.config.min_size, "Below minimum, requesting fill");
            self.request_fill();
        }
        Ok(proposal)
    }
}

fn fill_from(upstream: ProposalSource) -> FillFn<Proposal> {
    Arc::new(move || {
        let upstream = Arc::clone(&upstream);
        async move { upstream().await.map_err(anyhow::Error::from) }.boxed()
    })
}

/// Default expiration hook: reject expired drafts so the provider stops holding them.
pub fn reject_expired() -> ExpiredFn<Proposal> {
    Arc::new(|proposal: Proposal| {
        async move {
            if proposal.is_draft() {
                if let Err(e) = proposal.reject(EXPIRED_REASON).await {
                    tracing::warn!(target: "reqlet::proposal", proposal_id = %proposal.id(), error = %e, "Failed to reject expired proposal");
                }
            }
        }
        .boxed()
    })
}

fn on_expired(running: Weak<Running>, hook: ExpiredFn<Proposal>) -> ExpiredFn<Proposal> {
    Arc::new(move |proposal: Proposal| {
        let running = running.clone();
        let hook = Arc::clone(&hook);
        async move {
            tracing::debug!(target: "reqlet::proposal", proposal_id = %proposal.id(), "Proposal expired, requesting fill");
            hook(proposal).await;
            if let Some(running) = running.upgrade() {
                running.request_fill();
            }
        }
        .boxed()
    })
}

/// Batch requested proposals, merge them with the scored ones and rescore.
async fn scoring_loop(
    fill: Arc<ProposalFill>,
    scored: DynBuffer,
    scorer: ProposalScorer,
    debounce: Duration,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = fill.wait_for_any_items() => {}
        }
        let mut proposals = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            proposals = fill.get_all_requested(debounce) => proposals,
        };

        if proposals.is_empty() {
            match fill.try_get() {
                Ok(Some(proposal)) => proposals.push(proposal),
                Ok(None) => continue,
                Err(e) => {
                    tracing::error!(target: "reqlet::proposal", error = %e, "Proposal supply failed, scoring stopped");
                    scored.set_error(e);
                    return;
                }
            }
        }

        let new = proposals.len();
        proposals.extend(scored.get_all().await);
        let ranked = scorer.rank(proposals).await;
        tracing::debug!(
            target: "reqlet::proposal",
            new,
            total = ranked.len(),
            best = ranked.first().map(|(score, _)| *score),
            "Proposals rescored"
        );
        scored
            .put_all(ranked.into_iter().map(|(_, proposal)| proposal).collect())
            .await;
    }
}

/// Keeps a pool of upstream proposals filled in the background.
pub struct ProposalBuffer {
    config: ProposalBufferConfig,
    expiration: Option<ExpirationFn<Proposal>>,
    on_expiration: ExpiredFn<Proposal>,
    running: Mutex<Option<Arc<Running>>>,
}

impl ProposalBuffer {
    pub fn new(config: ProposalBufferConfig) -> Self {
        Self {
            config,
            expiration: None,
            on_expiration: reject_expired(),
            running: Mutex::new(None),
        }
    }

    /// Drop buffered proposals after a per-proposal delay. Expired proposals
    /// are handed to the expiration hook and replaced.
    pub fn with_expiration(mut self, expiration: ExpirationFn<Proposal>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Replace [`reject_expired`] as the hook run on each expired proposal.
    pub fn with_on_expiration(mut self, on_expiration: ExpiredFn<Proposal>) -> Self {
        self.on_expiration = on_expiration;
        self
    }

    fn expiry(&self) -> Option<(ExpirationFn<Proposal>, ExpiredFn<Proposal>)> {
        let expiration = self.expiration.clone()?;
        Some((expiration, Arc::clone(&self.on_expiration)))
    }
}

async fn start_running(
    slot: &Mutex<Option<Arc<Running>>>,
    name: &'static str,
    build: impl FnOnce() -> Arc<Running>,
) -> Result<ProposalSource, ManagerError> {
    let mut slot = slot.lock().await;
    if slot.is_some() {
        return Err(ManagerError::AlreadyStarted(name));
    }
    let running = build();
    running.start().await?;
    *slot = Some(Arc::clone(&running));

    Ok(Arc::new(move || {
        let running = Arc::clone(&running);
        async move { running.get().await }.boxed()
    }))
}

async fn stop_running(
    slot: &Mutex<Option<Arc<Running>>>,
    name: &'static str,
) -> Result<(), ManagerError> {
    let running = slot
        .lock()
        .await
        .take()
        .ok_or(ManagerError::NotStarted(name))?;
    running.stop().await
}

#[async_trait]
impl ProposalManagerPlugin for ProposalBuffer {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        start_running(&self.running, "proposal buffer", || {
            Running::build(self.config.clone(), upstream, self.expiry(), None)
        })
        .await
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        stop_running(&self.running, "proposal buffer").await
    }
}

/// A [`ProposalBuffer`] that hands out the best-scored proposal first.
///
/// Freshly filled proposals are collected for up to the scoring debounce,
/// merged with the already scored ones and the whole set is ranked again.
pub struct ScoringBuffer {
    config: ScoringBufferConfig,
    scorer: ProposalScorer,
    expiration: Option<ExpirationFn<Proposal>>,
    on_expiration: ExpiredFn<Proposal>,
    running: Mutex<Option<Arc<Running>>>,
}

impl ScoringBuffer {
    pub fn new(config: ScoringBufferConfig, scorer: ProposalScorer) -> Self {
        Self {
            config,
            scorer,
            expiration: None,
            on_expiration: reject_expired(),
            running: Mutex::new(None),
        }
    }

    /// Expire scored proposals after a per-proposal delay.
    pub fn with_expiration(mut self, expiration: ExpirationFn<Proposal>) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn with_on_expiration(mut self, on_expiration: ExpiredFn<Proposal>) -> Self {
        self.on_expiration = on_expiration;
        self
    }
}

#[async_trait]
impl ProposalManagerPlugin for ScoringBuffer {
    async fn start(&self, upstream: ProposalSource) -> Result<ProposalSource, ManagerError> {
        start_running(&self.running, "scoring buffer", || {
            Running::build(
                self.config.buffer.clone(),
                upstream,
                self.expiration
                    .clone()
                    .map(|expiration| (expiration, Arc::clone(&self.on_expiration))),
                Some((self.scorer.clone(), self.config.scoring_debounce)),
            )
        })
        .await
    }

    async fn stop(&self) -> Result<(), ManagerError> {
        stop_running(&self.running, "scoring buffer").await
    }
}
