//! Load balancer
//!
//! Turns a routing rule and the current registry/metrics state into an
//! ordered list of candidate models.

mod rule;
mod selector;

pub use rule::{LoadBalancingRule, RuleBook, Strategy};
pub use selector::LoadBalancer;
