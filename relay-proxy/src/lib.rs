//! Relay Proxy Engine
//!
//! The Tokio async engine behind the `relay` gateway: for every inbound request
//! addressed to a named backend service it consults the circuit breaker,
//! resolves and balances across healthy instances, reuses or builds a
//! forwarding proxy, and records the outcome.

pub mod body;
pub mod config;
pub mod connection_pool;
pub mod consul;
pub mod dispatcher;
pub mod error;
pub mod health_check;
pub mod proxy;
pub mod redis_store;
pub mod server;

pub use dispatcher::{DispatchConfig, Dispatcher};
pub use error::{DispatchError, ForwardError};
