//! The per-request dispatch pipeline.
//!
//! ```text
//! request -> cached handle? --yes--------------------------------------+
//!                 | no                                                  v
//!                 +-> breaker gate -> resolve -> round-robin -> build -> forward
//! ```
//!
//! Only the first request to a service (or the first after an eviction) goes
//! through discovery, balancing and the breaker gate. Later requests reuse the
//! cached handle and its target without re-validating it. A handle is evicted
//! when forwarding through it fails, or when an operator invalidates it.
//!
//! Nothing here serializes dispatches: concurrent requests may race on the
//! balancer cursor and record failures independently.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::Incoming;
use hyper::{Request, Response};
use relay_admin::{AdminError, ControlPlane, ServiceStatus};
use relay_core::{CircuitBreaker, InstanceResolver, RoundRobin, ServiceInstance};
use tracing::{debug, info, warn};

use crate::body::ProxyBody;
use crate::connection_pool::ConnectionPool;
use crate::error::DispatchError;
use crate::proxy::{ProxyCache, ProxyHandle};

/// Dispatcher tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Budget for one upstream forward, from connect to response head.
    pub upstream_timeout: Duration,
    /// Clear the service's failure counter after every successful forward.
    pub reset_failures_on_success: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            upstream_timeout: Duration::from_secs(30),
            reset_failures_on_success: true,
        }
    }
}

/// Routes requests for named services to backend instances.
pub struct Dispatcher {
    breaker: CircuitBreaker,
    resolver: InstanceResolver,
    balancer: RoundRobin,
    proxies: ProxyCache,
    pool: ConnectionPool,
    config: DispatchConfig,
}

impl Dispatcher {
    /// Assemble a dispatcher from its collaborators.
    pub fn new(
        breaker: CircuitBreaker,
        resolver: InstanceResolver,
        balancer: RoundRobin,
        config: DispatchConfig,
    ) -> Self {
        Self {
            breaker,
            resolver,
            balancer,
            proxies: ProxyCache::new(),
            pool: ConnectionPool::new(),
            config,
        }
    }

    /// The breaker consulted for every uncached service.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The process-local proxy cache.
    pub fn proxies(&self) -> &ProxyCache {
        &self.proxies
    }

    /// Forward `req` to an instance of `service`.
    pub async fn dispatch(
        &self,
        service: &str,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, DispatchError> {
        let handle = match self.proxy_for(service).await {
            Ok(handle) => handle,
            Err(err) => {
                self.note_failure(service, &err).await;
                return Err(err);
            }
        };

        match handle.forward(req).await {
            Ok(response) => {
                debug!(service, upstream = %handle.target(), status = %response.status(), "forwarded");
                if self.config.reset_failures_on_success {
                    if let Err(err) = self.breaker.record_success(service).await {
                        warn!(service, error = %err, "failed to clear failure counter");
                    }
                }
                Ok(response)
            }
            Err(err) => {
                let err = DispatchError::from_forward(service, err);
                if self.proxies.evict_if_current(service, &handle) {
                    debug!(service, upstream = %handle.target(), "evicted failing proxy handle");
                }
                self.note_failure(service, &err).await;
                Err(err)
            }
        }
    }

    /// The proxy handle of `service`, building one if none is cached.
    pub async fn proxy_for(&self, service: &str) -> Result<Arc<ProxyHandle>, DispatchError> {
        self.proxies
            .get_or_try_build(service, || self.build_proxy(service))
            .await
    }

    /// Evict the cached handle and instance snapshot of `service`.
    ///
    /// Returns the target of the evicted handle.
    pub async fn invalidate(&self, service: &str) -> Option<ServiceInstance> {
        let evicted = self.proxies.invalidate(service);
        self.resolver.invalidate(service).await;
        let target = evicted.map(|handle| handle.target().clone());
        info!(service, upstream = ?target, "proxy invalidated");
        target
    }

    /// Evict `handle` and the instance snapshot of `service`, unless a newer
    /// handle has already replaced it.
    pub async fn evict(&self, service: &str, handle: &Arc<ProxyHandle>) -> bool {
        if !self.proxies.evict_if_current(service, handle) {
            return false;
        }
        self.resolver.invalidate(service).await;
        true
    }

    async fn build_proxy(&self, service: &str) -> Result<ProxyHandle, DispatchError> {
        if self.gate_open(service).await {
            return Err(DispatchError::ServiceUnavailable {
                service: service.to_string(),
            });
        }

        let instances = self.resolver.resolve(service).await?;
        let target = self
            .balancer
            .next_instance(service, &instances)
            .await
            .map_err(|err| DispatchError::Internal(err.to_string()))?;

        info!(service, upstream = %target, candidates = instances.len(), "built proxy handle");
        Ok(ProxyHandle::new(
            service,
            target,
            self.pool.clone(),
            self.config.upstream_timeout,
        ))
    }

    async fn gate_open(&self, service: &str) -> bool {
        match self.breaker.is_open(service).await {
            Ok(open) => open,
            Err(err) => {
                warn!(service, error = %err, "breaker state unreadable, treating circuit as closed");
                false
            }
        }
    }

    async fn note_failure(&self, service: &str, err: &DispatchError) {
        if matches!(err, DispatchError::ServiceUnavailable { .. }) {
            debug!(service, "circuit open, failing fast");
            return;
        }
        warn!(service, kind = err.kind(), error = %err, "dispatch failed");
        if let Err(store_err) = self.breaker.record_failure(service).await {
            warn!(service, error = %store_err, "failed to record failure");
        }
    }
}

#[async_trait]
impl ControlPlane for Dispatcher {
    async fn invalidate(&self, service: &str) -> Result<(), AdminError> {
        Dispatcher::invalidate(self, service).await;
        Ok(())
    }

    async fn reset_breaker(&self, service: &str) -> Result<(), AdminError> {
        self.breaker
            .reset(service)
            .await
            .map_err(|err| AdminError(err.to_string()))?;
        info!(service, "circuit reset by operator");
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus, AdminError> {
        let circuit = self
            .breaker
            .state(service)
            .await
            .map_err(|err| AdminError(err.to_string()))?;
        Ok(ServiceStatus {
            service: service.to_string(),
            circuit,
            proxy_target: self.proxies.target(service).map(|target| target.authority()),
        })
    }
}
