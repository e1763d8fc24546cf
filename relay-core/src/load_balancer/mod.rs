//! Load balancing strategies.

pub mod round_robin;

pub use round_robin::{BalancerError, LoadBalancerCursor, RoundRobin};
