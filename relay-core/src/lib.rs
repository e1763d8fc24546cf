//! Relay Core functionality.
//!
//! This crate contains the domain models and the stateful pieces of the
//! gateway's dispatch pipeline: the circuit breaker, the caching instance
//! resolver and the round-robin load balancer, together with the seams they
//! are built on (the shared state store and the service registry).

pub mod breaker;
pub mod domain;
pub mod load_balancer;
pub mod resolver;
pub mod state;

pub use breaker::{BreakerConfig, CircuitBreaker, CircuitState};
pub use domain::instance::ServiceInstance;
pub use domain::registry::{
    HealthCheck, RegistryEntry, RegistryError, ServiceRegistry, StaticRegistry,
};
pub use load_balancer::{BalancerError, LoadBalancerCursor, RoundRobin};
pub use resolver::{InstanceResolver, ResolutionError, ResolverConfig};
pub use state::{MemoryStore, StateStore, StoreError};
