//! In-memory stand-ins for the network-facing collaborator.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::event_bus::ResourceEvent;
use crate::resource::{
    Activity, ActivityNode, Agreement, AgreementNode, Allocation, AllocationNode, BatchEvent,
    BatchNode, Command, DebitNote, Demand, DemandData, DemandNode, Invoice, MarketApi, PaymentApi,
    PaymentDocumentData, PaymentDocumentNode, Proposal, ProposalData, ProposalNode, ProposalState,
    Properties, ResourceError, ResourceKind,
};
use crate::session::Session;

pub(crate) fn proposal_data(id: &str, properties: Properties) -> ProposalData {
    ProposalData {
        proposal_id: id.to_string(),
        issuer_id: "provider".to_string(),
        properties,
        constraints: Vec::new(),
        state: ProposalState::Initial,
        timestamp: Utc::now(),
        prev_proposal_id: None,
    }
}

/// Let spawned tasks and the event bus catch up.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct MarketState {
    responses: Vec<(String, DemandData)>,
    rejected: Vec<String>,
    confirmed: Vec<String>,
    terminated: Vec<String>,
    released: Vec<String>,
    activities: Vec<String>,
    destroyed: Vec<String>,
    demands: Vec<Arc<FakeDemand>>,
    allocations: Vec<String>,
    released_allocations: Vec<String>,
    /// Accepted payment documents as (document id, amount).
    accepted: Vec<(String, String)>,
    offer_templates: Vec<(String, Properties)>,
    closed_responses: HashSet<String>,
    unapproved: HashSet<String>,
    failing_confirm: HashSet<String>,
    failing_activity: HashSet<String>,
    failing_commands: HashSet<String>,
}

/// Records every call made against it and produces scripted resources.
///
/// Failure switches are keyed by provider (issuer) id.
pub(crate) struct FakeMarket {
    me: Weak<FakeMarket>,
    session: Arc<Session>,
    default_demand: Demand,
    next_id: AtomicUsize,
    state: Mutex<MarketState>,
}

impl FakeMarket {
    pub fn new(session: Arc<Session>) -> Arc<Self> {
        let default_demand = Demand::new(FakeDemand::new(
            "demand",
            Arc::clone(&session),
            Utc::now() + chrono::Duration::hours(1),
        ));
        Arc::new_cyclic(|me: &Weak<FakeMarket>| Self {
            me: me.clone(),
            session,
            default_demand,
            next_id: AtomicUsize::new(0),
            state: Mutex::new(MarketState::default()),
        })
    }

    fn arc(&self) -> Arc<FakeMarket> {
        self.me.upgrade().unwrap()
    }

    fn state(&self) -> MutexGuard<'_, MarketState> {
        self.state.lock().unwrap()
    }

    fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    fn node(&self, data: ProposalData, demand: Demand, counter: Option<Proposal>) -> Arc<FakeProposal> {
        Arc::new(FakeProposal {
            market: self.arc(),
            id: data.proposal_id.clone(),
            data: Mutex::new(data),
            demand,
            counter: Mutex::new(counter),
        })
    }

    pub fn proposal_node(&self, id: &str, issuer: &str) -> Arc<FakeProposal> {
        let mut data = proposal_data(id, Properties::new());
        data.issuer_id = issuer.to_string();
        self.node(data, self.default_demand.clone(), None)
    }

    /// A registered initial offer without properties.
    pub fn proposal(&self, id: &str, issuer: &str) -> Proposal {
        self.offer(id, issuer, Properties::new())
    }

    pub fn offer(&self, id: &str, issuer: &str, properties: Properties) -> Proposal {
        let mut data = proposal_data(id, properties);
        data.issuer_id = issuer.to_string();
        let node = self.node(data, self.default_demand.clone(), None);
        self.session.proposal(node).unwrap()
    }

    /// An offer that already went through one round of negotiation.
    pub fn draft(&self, id: &str, issuer: &str, properties: Properties) -> Proposal {
        let mut data = proposal_data(id, properties);
        data.issuer_id = issuer.to_string();
        data.state = ProposalState::Draft;
        let node = self.node(data, self.default_demand.clone(), None);
        self.session.proposal(node).unwrap()
    }

    /// Offers every future subscription receives, as (issuer, properties).
    pub fn set_offer_templates(&self, templates: Vec<(String, Properties)>) {
        self.state().offer_templates = templates;
    }

    /// A demand that yields one offer per issuer and then waits for more.
    pub fn demand_with_offers(&self, id: &str, issuers: &[&str]) -> (Demand, Arc<FakeDemand>) {
        let fake = FakeDemand::new(
            id,
            Arc::clone(&self.session),
            Utc::now() + chrono::Duration::hours(1),
        );
        let demand = self.session.demand(fake.clone()).unwrap();
        for (index, issuer) in issuers.iter().enumerate() {
            let mut data = proposal_data(&format!("{id}-{index}"), Properties::new());
            data.issuer_id = issuer.to_string();
            let node = self.node(data, demand.clone(), None);
            fake.push(self.session.proposal(node).unwrap());
        }
        (demand, fake)
    }

    pub fn close_responses(&self, proposal_id: &str) {
        self.state().closed_responses.insert(proposal_id.to_string());
    }

    pub fn deny_approval(&self, issuer: &str) {
        self.state().unapproved.insert(issuer.to_string());
    }

    pub fn fail_confirm(&self, issuer: &str) {
        self.state().failing_confirm.insert(issuer.to_string());
    }

    pub fn fail_activity(&self, issuer: &str) {
        self.state().failing_activity.insert(issuer.to_string());
    }

    /// Every `Run` command executed on this issuer's activities fails.
    pub fn fail_commands(&self, issuer: &str) {
        self.state().failing_commands.insert(issuer.to_string());
    }

    /// Counter-proposals sent in response to `proposal_id`.
    pub fn responses_to(&self, proposal_id: &str) -> Vec<DemandData> {
        self.state()
            .responses
            .iter()
            .filter(|(id, _)| id == proposal_id)
            .map(|(_, data)| data.clone())
            .collect()
    }

    pub fn response_count(&self) -> usize {
        self.state().responses.len()
    }

    pub fn rejected(&self) -> Vec<String> {
        self.state().rejected.clone()
    }

    pub fn confirmed(&self) -> Vec<String> {
        self.state().confirmed.clone()
    }

    pub fn terminated(&self) -> Vec<String> {
        self.state().terminated.clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.state().released.clone()
    }

    pub fn activities(&self) -> Vec<String> {
        self.state().activities.clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state().destroyed.clone()
    }

    pub fn demands(&self) -> Vec<Arc<FakeDemand>> {
        self.state().demands.clone()
    }

    pub fn allocations(&self) -> Vec<String> {
        self.state().allocations.clone()
    }

    pub fn released_allocations(&self) -> Vec<String> {
        self.state().released_allocations.clone()
    }

    pub fn accepted(&self) -> Vec<(String, String)> {
        self.state().accepted.clone()
    }

    fn payment_document(&self, prefix: &str, agreement_id: &str, amount: &str) -> Arc<FakePaymentDocument> {
        Arc::new(FakePaymentDocument {
            market: self.arc(),
            data: PaymentDocumentData {
                document_id: format!("{prefix}-{}", self.next_id()),
                agreement_id: agreement_id.to_string(),
                amount: amount.to_string(),
                timestamp: Utc::now(),
            },
        })
    }

    /// Issue an invoice, announced on the session event bus.
    pub fn invoice(&self, agreement_id: &str, amount: &str) -> Invoice {
        let node = self.payment_document("invoice", agreement_id, amount);
        self.session.invoice(node).unwrap()
    }

    pub fn debit_note(&self, agreement_id: &str, amount: &str) -> DebitNote {
        let node = self.payment_document("debit-note", agreement_id, amount);
        self.session.debit_note(node).unwrap()
    }

    fn is_set(&self, pick: fn(&MarketState) -> &HashSet<String>, key: &str) -> bool {
        pick(&self.state()).contains(key)
    }
}

#[async_trait]
impl MarketApi for FakeMarket {
    async fn subscribe_demand(
        &self,
        data: &DemandData,
        expiration: DateTime<Utc>,
    ) -> Result<Demand, ResourceError> {
        let id = format!("demand-{}", self.next_id());
        let fake = FakeDemand::new(&id, Arc::clone(&self.session), expiration);
        *fake.data.lock().unwrap() = data.clone();
        let demand = self.session.demand(fake.clone())?;

        let templates = self.state().offer_templates.clone();
        for (index, (issuer, properties)) in templates.into_iter().enumerate() {
            let mut offer = proposal_data(&format!("{id}-{index}"), properties);
            offer.issuer_id = issuer;
            let node = self.node(offer, demand.clone(), None);
            fake.push(self.session.proposal(node)?);
        }
        self.state().demands.push(fake);
        Ok(demand)
    }
}

#[async_trait]
impl PaymentApi for FakeMarket {
    async fn create_allocation(
        &self,
        _budget: f64,
        _network: &str,
        _driver: &str,
    ) -> Result<Allocation, ResourceError> {
        let id = format!("allocation-{}", self.next_id());
        self.state().allocations.push(id.clone());
        self.session.allocation(Arc::new(FakeAllocation {
            market: self.arc(),
            id,
        }))
    }
}

struct FakeAllocation {
    market: Arc<FakeMarket>,
    id: String,
}

#[async_trait]
impl AllocationNode for FakeAllocation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn release(&self) -> Result<(), ResourceError> {
        self.market.state().released_allocations.push(self.id.clone());
        Ok(())
    }
}

struct FakePaymentDocument {
    market: Arc<FakeMarket>,
    data: PaymentDocumentData,
}

#[async_trait]
impl PaymentDocumentNode for FakePaymentDocument {
    fn id(&self) -> &str {
        &self.data.document_id
    }

    fn data(&self) -> PaymentDocumentData {
        self.data.clone()
    }

    async fn accept(&self, _allocation: &Allocation, amount: &str) -> Result<(), ResourceError> {
        self.market
            .state()
            .accepted
            .push((self.data.document_id.clone(), amount.to_string()));
        Ok(())
    }
}

pub(crate) struct FakeDemand {
    id: String,
    session: Arc<Session>,
    data: Mutex<DemandData>,
    expiration: DateTime<Utc>,
    offers: Mutex<VecDeque<Proposal>>,
    arrived: Notify,
    unsubscribed: AtomicBool,
}

impl FakeDemand {
    fn new(id: &str, session: Arc<Session>, expiration: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            session,
            data: Mutex::new(DemandData::default()),
            expiration,
            offers: Mutex::new(VecDeque::new()),
            arrived: Notify::new(),
            unsubscribed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, offer: Proposal) {
        self.offers.lock().unwrap().push_back(offer);
        self.arrived.notify_waiters();
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    pub fn pending_offers(&self) -> usize {
        self.offers.lock().unwrap().len()
    }
}

#[async_trait]
impl DemandNode for FakeDemand {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> DemandData {
        self.data.lock().unwrap().clone()
    }

    fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    async fn next_initial_proposal(&self) -> Option<Proposal> {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_unsubscribed() {
                return None;
            }
            let offer = self.offers.lock().unwrap().pop_front();
            if offer.is_some() {
                return offer;
            }
            notified.await;
        }
    }

    async fn unsubscribe(&self) -> Result<(), ResourceError> {
        self.unsubscribed.store(true, Ordering::SeqCst);
        self.arrived.notify_waiters();
        if let Ok(demand) = self.session.registry().get::<Demand>(ResourceKind::Demand, &self.id) {
            self.session.emit(ResourceEvent::DemandUnsubscribed(demand));
        }
        Ok(())
    }
}

pub(crate) struct FakeProposal {
    market: Arc<FakeMarket>,
    id: String,
    data: Mutex<ProposalData>,
    demand: Demand,
    /// Provider answer to the counter-proposal this node represents.
    counter: Mutex<Option<Proposal>>,
}

impl FakeProposal {
    fn snapshot(&self) -> ProposalData {
        self.data.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProposalNode for FakeProposal {
    fn id(&self) -> &str {
        &self.id
    }

    fn data(&self) -> ProposalData {
        self.snapshot()
    }

    fn demand(&self) -> Demand {
        self.demand.clone()
    }

    async fn respond(&self, data: &DemandData) -> Result<Proposal, ResourceError> {
        let offer = self.snapshot();
        let market = &self.market;
        market.state().responses.push((self.id.clone(), data.clone()));

        let ours_id = format!("{}/response-{}", self.id, market.next_id());
        let counter = if market.is_set(|state| &state.closed_responses, &self.id) {
            None
        } else {
            let mut draft = offer.clone();
            draft.proposal_id = format!("{}-draft", self.id);
            draft.state = ProposalState::Draft;
            draft.prev_proposal_id = Some(ours_id.clone());
            draft.timestamp = Utc::now();
            let node = market.node(draft, self.demand.clone(), None);
            Some(market.session.proposal(node)?)
        };

        let mut ours = proposal_data(&ours_id, data.properties.clone());
        ours.issuer_id = "requestor".to_string();
        ours.state = ProposalState::Draft;
        ours.prev_proposal_id = Some(self.id.clone());
        let node = market.node(ours, self.demand.clone(), counter);
        market.session.proposal(node)
    }

    async fn next_response(&self) -> Option<Proposal> {
        self.counter.lock().unwrap().take()
    }

    async fn reject(&self, _reason: &str) -> Result<(), ResourceError> {
        self.market.state().rejected.push(self.id.clone());
        self.data.lock().unwrap().state = ProposalState::Rejected;
        if let Ok(proposal) = self.market.session.registry().get::<Proposal>(ResourceKind::Proposal, &self.id) {
            self.market.session.emit(ResourceEvent::ProposalRejected(proposal));
        }
        Ok(())
    }

    async fn create_agreement(&self) -> Result<Agreement, ResourceError> {
        let market = &self.market;
        let proposal = market
            .session
            .registry()
            .get::<Proposal>(ResourceKind::Proposal, &self.id)?;
        let issuer = self.snapshot().issuer_id;
        let id = format!("agreement-{}", market.next_id());
        let node = Arc::new_cyclic(|me: &Weak<FakeAgreement>| FakeAgreement {
            me: me.clone(),
            market: Arc::clone(market),
            id,
            issuer,
            proposal,
        });
        market.session.agreement(node)
    }
}

pub(crate) struct FakeAgreement {
    me: Weak<FakeAgreement>,
    market: Arc<FakeMarket>,
    id: String,
    issuer: String,
    proposal: Proposal,
}

impl FakeAgreement {
    fn handle(&self) -> Agreement {
        Agreement::new(self.me.upgrade().unwrap())
    }
}

#[async_trait]
impl AgreementNode for FakeAgreement {
    fn id(&self) -> &str {
        &self.id
    }

    fn proposal(&self) -> Proposal {
        self.proposal.clone()
    }

    async fn confirm(&self) -> Result<(), ResourceError> {
        if self.market.is_set(|state| &state.failing_confirm, &self.issuer) {
            return Err(ResourceError::Api(format!("confirm of {} refused", self.id)));
        }
        self.market.state().confirmed.push(self.id.clone());
        Ok(())
    }

    async fn wait_for_approval(&self) -> Result<bool, ResourceError> {
        Ok(!self.market.is_set(|state| &state.unapproved, &self.issuer))
    }

    async fn create_activity(&self) -> Result<Activity, ResourceError> {
        if self.market.is_set(|state| &state.failing_activity, &self.issuer) {
            return Err(ResourceError::Api(format!("no activity on {}", self.id)));
        }
        let id = format!("activity-{}", self.market.next_id());
        self.market.state().activities.push(id.clone());
        let node = Arc::new_cyclic(|me: &Weak<FakeActivity>| FakeActivity {
            me: me.clone(),
            market: Arc::clone(&self.market),
            id,
            issuer: self.issuer.clone(),
            agreement: self.handle(),
            destroyed: AtomicBool::new(false),
        });
        self.market.session.activity(node)
    }

    async fn terminate(&self, _reason: &str) -> Result<(), ResourceError> {
        self.market.state().terminated.push(self.id.clone());
        self.market
            .session
            .emit(ResourceEvent::AgreementTerminated(self.handle()));
        Ok(())
    }

    async fn release(&self) -> Result<(), ResourceError> {
        self.market.state().released.push(self.id.clone());
        self.market
            .session
            .emit(ResourceEvent::AgreementReleased(self.handle()));
        Ok(())
    }
}

pub(crate) struct FakeActivity {
    me: Weak<FakeActivity>,
    market: Arc<FakeMarket>,
    id: String,
    issuer: String,
    agreement: Agreement,
    destroyed: AtomicBool,
}

impl FakeActivity {
    fn handle(&self) -> Activity {
        Activity::new(self.me.upgrade().unwrap())
    }
}

#[async_trait]
impl ActivityNode for FakeActivity {
    fn id(&self) -> &str {
        &self.id
    }

    fn agreement(&self) -> Agreement {
        self.agreement.clone()
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    async fn execute(&self, script: Vec<Command>) -> Result<Arc<dyn BatchNode>, ResourceError> {
        if self.is_destroyed() {
            return Err(ResourceError::Api(format!("{} is destroyed", self.id)));
        }
        self.market.session.emit(ResourceEvent::ActivityBusy(self.handle()));
        let failing = self.market.is_set(|state| &state.failing_commands, &self.issuer);
        Ok(Arc::new(FakeBatch {
            id: format!("batch-{}", self.market.next_id()),
            activity: self.handle(),
            session: Arc::clone(&self.market.session),
            script,
            failing,
        }))
    }

    async fn destroy(&self) -> Result<(), ResourceError> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.market.state().destroyed.push(self.id.clone());
            self.market
                .session
                .emit(ResourceEvent::ActivityDestroyed(self.handle()));
        }
        Ok(())
    }
}

struct FakeBatch {
    id: String,
    activity: Activity,
    session: Arc<Session>,
    script: Vec<Command>,
    failing: bool,
}

#[async_trait]
impl BatchNode for FakeBatch {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self, _timeout: Option<Duration>) -> Result<Vec<BatchEvent>, ResourceError> {
        tokio::task::yield_now().await;
        let events = self
            .script
            .iter()
            .enumerate()
            .map(|(index, command)| {
                let success = !(self.failing && matches!(command, Command::Run { .. }));
                BatchEvent {
                    index,
                    success,
                    stdout: match command {
                        Command::Run { args, .. } if success => Some(args.join(" ")),
                        _ => None,
                    },
                    stderr: None,
                    message: (!success).then(|| format!("command {index} failed")),
                }
            })
            .collect();
        self.session.emit(ResourceEvent::ActivityIdle(self.activity.clone()));
        Ok(events)
    }
}
