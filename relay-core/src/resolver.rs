//! Instance resolution with a shared cache in front of the registry.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::instance::ServiceInstance;
use crate::domain::registry::{RegistryError, ServiceRegistry};
use crate::state::{keys, StateStore};

/// Errors that terminate resolution for the current request. Never cached.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The registry knows no instance whose checks are all passing.
    #[error("no healthy instance registered for service '{0}'")]
    NoHealthyInstance(String),
    /// The registry itself failed.
    #[error("registry query for service '{service}' failed: {source}")]
    Registry {
        /// Service that was being resolved.
        service: String,
        /// Underlying registry failure.
        #[source]
        source: RegistryError,
    },
}

/// Resolver tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Lifetime of a cached instance snapshot.
    pub cache_ttl: Duration,
    /// Narrow every resolution down to the first passing entry.
    pub first_healthy_only: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            first_healthy_only: false,
        }
    }
}

/// Looks up healthy instances, preferring the cached snapshot over the registry.
#[derive(Clone)]
pub struct InstanceResolver {
    registry: Arc<dyn ServiceRegistry>,
    store: Arc<dyn StateStore>,
    config: ResolverConfig,
}

impl InstanceResolver {
    /// Build a resolver over a registry and the shared cache.
    pub fn new(
        registry: Arc<dyn ServiceRegistry>,
        store: Arc<dyn StateStore>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Healthy instances of `service`. Never returns an empty list.
    pub async fn resolve(&self, service: &str) -> Result<Vec<ServiceInstance>, ResolutionError> {
        if let Some(cached) = self.cached(service).await {
            debug!(service, instances = cached.len(), "instance cache hit");
            return Ok(cached);
        }

        let entries = self
            .registry
            .query_health(service)
            .await
            .map_err(|source| ResolutionError::Registry {
                service: service.to_string(),
                source,
            })?;

        let mut instances: Vec<ServiceInstance> = entries
            .iter()
            .filter(|entry| entry.is_passing())
            .map(|entry| entry.instance())
            .collect();
        if instances.is_empty() {
            return Err(ResolutionError::NoHealthyInstance(service.to_string()));
        }
        if self.config.first_healthy_only {
            instances.truncate(1);
        }

        debug!(
            service,
            registered = entries.len(),
            healthy = instances.len(),
            "resolved from registry"
        );
        self.store_snapshot(service, &instances).await;
        Ok(instances)
    }

    /// Forget the cached snapshot so the next resolution queries the registry.
    pub async fn invalidate(&self, service: &str) {
        if let Err(err) = self.store.delete(&keys::instances(service)).await {
            warn!(service, error = %err, "failed to drop cached instances");
        }
    }

    async fn cached(&self, service: &str) -> Option<Vec<ServiceInstance>> {
        let raw = match self.store.get(&keys::instances(service)).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(service, error = %err, "instance cache unavailable, querying registry");
                return None;
            }
        };
        match serde_json::from_str::<Vec<ServiceInstance>>(&raw) {
            Ok(instances) if !instances.is_empty() => Some(instances),
            Ok(_) => None,
            Err(err) => {
                warn!(service, error = %err, "discarding undecodable instance cache");
                None
            }
        }
    }

    async fn store_snapshot(&self, service: &str, instances: &[ServiceInstance]) {
        let encoded = match serde_json::to_string(instances) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(service, error = %err, "failed to encode instance snapshot");
                return;
            }
        };
        let key = keys::instances(service);
        if let Err(err) = self.store.set(&key, &encoded, Some(self.config.cache_ttl)).await {
            warn!(service, error = %err, "failed to cache instance snapshot");
        }
    }
}
