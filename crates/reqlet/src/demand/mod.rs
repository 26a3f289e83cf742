//! Sources of initial offers.
//!
//! [`RefreshingDemandManager`] keeps one live subscription on the market and
//! renews it before it expires. [`AggregatingDemandManager`] and
//! [`UnionDemandManager`] merge several offer sources into one.

mod combined;
mod refreshing;

pub use combined::{AggregatingDemandManager, UnionDemandManager};
pub use refreshing::{RefreshingDemandConfig, RefreshingDemandManager};
