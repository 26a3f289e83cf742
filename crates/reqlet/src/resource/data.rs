use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property bag carried by demands and proposals.
pub type Properties = serde_json::Map<String, Value>;

pub const PRICING_MODEL: &str = "golem.com.pricing.model";
pub const PRICING_LINEAR_COEFFS: &str = "golem.com.pricing.model.linear.coeffs";
pub const USAGE_VECTOR: &str = "golem.com.usage.vector";
pub const INF_MEM_GIB: &str = "golem.inf.mem.gib";
pub const INF_CPU_THREADS: &str = "golem.inf.cpu.threads";
pub const PAYMENT_PLATFORM_PREFIX: &str = "golem.com.payment.platform.";
pub const CHOSEN_PAYMENT_PLATFORM: &str = "golem.com.payment.chosen-platform";
pub const DEBIT_NOTE_INTERVAL: &str = "golem.com.scheme.payu.debit-note.interval-sec?";
pub const PAYMENT_TIMEOUT: &str = "golem.com.scheme.payu.payment-timeout-sec?";
pub const DEMAND_EXPIRATION: &str = "golem.srv.comp.expiration";

/// Working copy of the terms negotiated in one round.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DemandData {
    pub properties: Properties,
    pub constraints: Vec<String>,
}

impl DemandData {
    pub fn new(properties: Properties, constraints: Vec<String>) -> Self {
        Self {
            properties,
            constraints,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalState {
    Initial,
    Draft,
    Rejected,
    Accepted,
    Expired,
}

/// Snapshot of one node in a negotiation tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalData {
    pub proposal_id: String,
    pub issuer_id: String,
    pub properties: Properties,
    pub constraints: Vec<String>,
    pub state: ProposalState,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_proposal_id: Option<String>,
}

impl ProposalData {
    pub fn property_f64(&self, key: &str) -> Option<f64> {
        self.properties.get(key).and_then(Value::as_f64)
    }

    pub fn is_initial(&self) -> bool {
        self.state == ProposalState::Initial
    }

    pub fn is_draft(&self) -> bool {
        self.state == ProposalState::Draft
    }
}

/// Payment document (invoice or debit note) issued by a provider for an agreement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDocumentData {
    pub document_id: String,
    pub agreement_id: String,
    /// Decimal amount due, kept as the provider wrote it.
    pub amount: String,
    pub timestamp: DateTime<Utc>,
}

/// One command of an activity script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Deploy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<Value>,
    },
    Start,
    Run {
        entry_point: String,
        #[serde(default)]
        args: Vec<String>,
    },
    SendFile {
        src: String,
        dst: String,
    },
    DownloadFile {
        src: String,
        dst: String,
    },
}

/// Outcome of one command in an executed batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEvent {
    pub index: usize,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
