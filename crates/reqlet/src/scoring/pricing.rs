use std::time::Duration;

use serde_json::Value;

use crate::resource::{
    INF_CPU_THREADS, PRICING_LINEAR_COEFFS, PRICING_MODEL, ProposalData, Properties, USAGE_VECTOR,
};

/// Estimated cost of a proposal, `None` when it cannot be priced.
pub trait Pricing: Send + Sync {
    fn price(&self, data: &ProposalData) -> Option<f64>;
}

impl<F> Pricing for F
where
    F: Fn(&ProposalData) -> Option<f64> + Send + Sync,
{
    fn price(&self, data: &ProposalData) -> Option<f64> {
        self(data)
    }
}

/// Usage vector assumed when an offer does not publish one.
const DEFAULT_USAGE_VECTOR: [&str; 2] = ["golem.usage.duration_sec", "golem.usage.cpu_sec"];

/// Prices of a `linear` pricing model, one per usage counter plus a fixed start price.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearCoeffs {
    pub usage_vector: Vec<String>,
    pub price_storage_gib: f64,
    pub price_mem_gib: f64,
    pub price_cpu_sec: f64,
    pub price_duration_sec: f64,
    pub price_initial: f64,
}

impl LinearCoeffs {
    pub fn from_properties(properties: &Properties) -> Option<Self> {
        let model = properties.get(PRICING_MODEL).and_then(Value::as_str);
        if model != Some("linear") {
            tracing::trace!(target: "reqlet::scoring", ?model, "Pricing model is not linear, ignoring");
            return None;
        }

        let coeffs: Vec<f64> = properties
            .get(PRICING_LINEAR_COEFFS)?
            .as_array()?
            .iter()
            .map(Value::as_f64)
            .collect::<Option<_>>()?;
        let usage_vector: Vec<String> = match properties.get(USAGE_VECTOR) {
            Some(vector) => vector
                .as_array()?
                .iter()
                .map(|usage| usage.as_str().map(str::to_string))
                .collect::<Option<_>>()?,
            None => DEFAULT_USAGE_VECTOR.iter().map(|usage| usage.to_string()).collect(),
        };

        if coeffs.len() != usage_vector.len() + 1 {
            tracing::debug!(
                target: "reqlet::scoring",
                coeffs = coeffs.len(),
                usage = usage_vector.len(),
                "Linear coeffs must match the usage vector plus one, ignoring"
            );
            return None;
        }

        let mut linear = Self {
            price_initial: coeffs[coeffs.len() - 1],
            ..Self::default()
        };
        for (usage, coeff) in usage_vector.iter().zip(&coeffs) {
            match usage.as_str() {
                "golem.usage.cpu_sec" | "golem.usage.cpu-sec" => linear.price_cpu_sec = *coeff,
                "golem.usage.duration_sec" | "golem.usage.duration-sec" => {
                    linear.price_duration_sec = *coeff
                }
                "golem.usage.storage_gib" | "golem.usage.storage-gib" => {
                    linear.price_storage_gib = *coeff
                }
                "golem.usage.gib" => linear.price_mem_gib = *coeff,
                _ => {}
            }
        }
        linear.usage_vector = usage_vector;
        Some(linear)
    }

    pub fn get(&self, coeff: Coeff) -> f64 {
        match coeff {
            Coeff::StorageGib => self.price_storage_gib,
            Coeff::MemGib => self.price_mem_gib,
            Coeff::CpuSec => self.price_cpu_sec,
            Coeff::DurationSec => self.price_duration_sec,
            Coeff::Initial => self.price_initial,
        }
    }
}

fn cpu_threads(data: &ProposalData) -> Option<f64> {
    data.property_f64(INF_CPU_THREADS).filter(|threads| *threads > 0.0)
}

/// Expected cost of running for `average_duration` at `average_cpu_load`.
#[derive(Debug, Clone)]
pub struct LinearAverageCostPricing {
    average_cpu_load: f64,
    average_duration: Duration,
}

impl LinearAverageCostPricing {
    pub fn new(average_cpu_load: f64, average_duration: Duration) -> Self {
        Self {
            average_cpu_load,
            average_duration,
        }
    }

    fn cost(&self, coeffs: &LinearCoeffs) -> f64 {
        let duration = self.average_duration.as_secs_f64();
        coeffs.price_initial
            + coeffs.price_duration_sec * duration
            + coeffs.price_cpu_sec * self.average_cpu_load * duration
    }
}

impl Pricing for LinearAverageCostPricing {
    fn price(&self, data: &ProposalData) -> Option<f64> {
        LinearCoeffs::from_properties(&data.properties).map(|coeffs| self.cost(&coeffs))
    }
}

/// [`LinearAverageCostPricing`] with start and duration prices spread over the offered threads.
#[derive(Debug, Clone)]
pub struct LinearPerCpuAverageCostPricing(LinearAverageCostPricing);

impl LinearPerCpuAverageCostPricing {
    pub fn new(average_cpu_load: f64, average_duration: Duration) -> Self {
        Self(LinearAverageCostPricing::new(average_cpu_load, average_duration))
    }
}

impl Pricing for LinearPerCpuAverageCostPricing {
    fn price(&self, data: &ProposalData) -> Option<f64> {
        let mut coeffs = LinearCoeffs::from_properties(&data.properties)?;
        let threads = cpu_threads(data)?;
        coeffs.price_initial /= threads;
        coeffs.price_duration_sec /= threads;
        Some(self.0.cost(&coeffs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coeff {
    StorageGib,
    MemGib,
    CpuSec,
    DurationSec,
    Initial,
}

/// A single linear coefficient used as the price.
#[derive(Debug, Clone, Copy)]
pub struct LinearCoeffsCost(pub Coeff);

impl Pricing for LinearCoeffsCost {
    fn price(&self, data: &ProposalData) -> Option<f64> {
        LinearCoeffs::from_properties(&data.properties).map(|coeffs| coeffs.get(self.0))
    }
}

/// A single linear coefficient divided by the offered thread count.
#[derive(Debug, Clone, Copy)]
pub struct LinearPerCpuCoeffsCost(pub Coeff);

impl Pricing for LinearPerCpuCoeffsCost {
    fn price(&self, data: &ProposalData) -> Option<f64> {
        let threads = cpu_threads(data)?;
        LinearCoeffsCost(self.0).price(data).map(|price| price / threads)
    }
}
