//! Counting permits used for backpressure.
//!
//! A [`PermitSource`] tracks two counters:
//! - grant: permits that may still be acquired
//! - pending: permits acquired but not yet released
//!
//! `request N items` maps to `increase(N)`; each producer iteration acquires one
//! permit before producing one item. The drained signal is raised whenever the
//! grant count is zero.

mod source;

pub use source::{PermitError, PermitGuard, PermitSource};
