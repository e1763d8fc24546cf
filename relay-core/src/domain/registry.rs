//! Service discovery seam.
//!
//! The gateway never talks to a concrete registry directly. Everything goes
//! through [`ServiceRegistry`], so the Consul client used in production and the
//! [`StaticRegistry`] used in tests and local development are interchangeable.

use std::collections::HashMap;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::instance::ServiceInstance;

/// The check status string a registry reports for a healthy check.
pub const PASSING: &str = "passing";

/// A single health check attached to a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Raw status reported by the registry, e.g. `passing`, `warning`, `critical`.
    pub status: String,
}

impl HealthCheck {
    /// A check reporting `passing`.
    pub fn passing() -> Self {
        Self {
            status: PASSING.to_string(),
        }
    }

    /// A check reporting `critical`.
    pub fn critical() -> Self {
        Self {
            status: "critical".to_string(),
        }
    }
}

/// One row of a registry health query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Address the service instance advertises.
    pub address: String,
    /// Port the service instance advertises.
    pub port: u16,
    /// Health checks currently attached to the instance.
    pub checks: Vec<HealthCheck>,
}

impl RegistryEntry {
    /// Build an entry whose only check is passing.
    pub fn healthy(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            checks: vec![HealthCheck::passing()],
        }
    }

    /// True when every attached check reports `passing`.
    pub fn is_passing(&self) -> bool {
        self.checks.iter().all(|check| check.status == PASSING)
    }

    /// The instance this entry describes.
    pub fn instance(&self) -> ServiceInstance {
        ServiceInstance::new(self.address.clone(), self.port)
    }
}

/// Errors raised while querying a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry could not be reached or answered with a transport error.
    #[error("registry unreachable: {0}")]
    Unreachable(String),
    /// The registry answered with a non-success status.
    #[error("registry returned status {status} for service '{service}'")]
    Status {
        /// Service that was queried.
        service: String,
        /// HTTP status code returned.
        status: u16,
    },
    /// The registry answered with a payload that could not be decoded.
    #[error("invalid registry response: {0}")]
    Decode(String),
    /// The query did not complete in time.
    #[error("registry query timed out")]
    Timeout,
}

/// Async interface implemented by discovery backends.
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// Returns every known instance of `service` together with its health checks.
    async fn query_health(&self, service: &str) -> Result<Vec<RegistryEntry>, RegistryError>;
}

type Topology = HashMap<String, Vec<RegistryEntry>>;

/// An in-process registry whose topology is replaced atomically.
///
/// Uses `ArcSwap` so readers on the dispatch path never take a lock while an
/// operator or a test swaps the instance set of a service.
#[derive(Debug, Default)]
pub struct StaticRegistry {
    services: ArcSwap<Topology>,
}

impl StaticRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the entries registered for `service`.
    pub fn set_service(&self, service: &str, entries: Vec<RegistryEntry>) {
        self.services.rcu(|current| {
            let mut next = Topology::clone(current);
            next.insert(service.to_string(), entries.clone());
            next
        });
    }

    /// Atomically drop every entry registered for `service`.
    pub fn remove_service(&self, service: &str) {
        self.services.rcu(|current| {
            let mut next = Topology::clone(current);
            next.remove(service);
            next
        });
    }

    /// Names of all registered services.
    pub fn services(&self) -> Vec<String> {
        self.services.load().keys().cloned().collect()
    }
}

#[async_trait]
impl ServiceRegistry for StaticRegistry {
    async fn query_health(&self, service: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        Ok(self
            .services
            .load()
            .get(service)
            .cloned()
            .unwrap_or_default())
    }
}
