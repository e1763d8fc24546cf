//! Per-service circuit breaker backed by the shared state store.
//!
//! The breaker has two stored states. CLOSED is the absence of an open
//! snapshot; OPEN is a `circuit:{service}` entry written with a TTL equal to the
//! recovery timeout. When that entry expires the circuit is closed again without
//! anyone calling [`CircuitBreaker::reset`], so the half-open phase is passive:
//! the first request after expiry is simply let through.
//!
//! ```text
//! CLOSED --(failures >= threshold)--> OPEN --(TTL expiry)--> CLOSED
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::state::{keys, StateStore, StoreError};

/// Tunables of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Failures within one observation window that open the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit (and a failure window) lives in the store.
    pub recovery_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state of one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    /// Whether requests are currently being rejected.
    pub is_open: bool,
    /// Failures counted in the current window, or the count that opened the circuit.
    pub failure_count: u32,
}

/// Failure-gating for backend services.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Build a breaker over `store`. A zero threshold is raised to one.
    pub fn new(store: Arc<dyn StateStore>, mut config: BreakerConfig) -> Self {
        config.failure_threshold = config.failure_threshold.max(1);
        Self { store, config }
    }

    /// The effective configuration.
    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    /// Whether the circuit of `service` is open. Missing or expired state is closed.
    pub async fn is_open(&self, service: &str) -> Result<bool, StoreError> {
        Ok(self.open_snapshot(service).await?.is_some())
    }

    /// Count one failure against `service`, opening the circuit on the threshold.
    ///
    /// While the circuit is open this does not touch the store. Returns the
    /// state after the call.
    pub async fn record_failure(&self, service: &str) -> Result<CircuitState, StoreError> {
        if let Some(open) = self.open_snapshot(service).await? {
            debug!(service, "circuit already open, failure not counted");
            return Ok(open);
        }

        let failure_count = self.failure_count(service).await?.saturating_add(1);
        let ttl = Some(self.config.recovery_timeout);

        if failure_count >= self.config.failure_threshold {
            let state = CircuitState {
                is_open: true,
                failure_count,
            };
            let encoded = encode(&keys::circuit(service), &state)?;
            self.store.set(&keys::circuit(service), &encoded, ttl).await?;
            // a fresh window starts once the open state expires
            self.store.delete(&keys::failures(service)).await?;
            warn!(
                service,
                failure_count,
                recovery_timeout_secs = self.config.recovery_timeout.as_secs(),
                "circuit opened"
            );
            return Ok(state);
        }

        self.store
            .set(&keys::failures(service), &failure_count.to_string(), ttl)
            .await?;
        debug!(service, failure_count, "failure recorded");
        Ok(CircuitState {
            is_open: false,
            failure_count,
        })
    }

    /// Clear the failure counter of `service` after a successful call.
    pub async fn record_success(&self, service: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::failures(service)).await
    }

    /// Drop every piece of breaker state for `service`, closing the circuit.
    pub async fn reset(&self, service: &str) -> Result<(), StoreError> {
        self.store.delete(&keys::circuit(service)).await?;
        self.store.delete(&keys::failures(service)).await
    }

    /// Current state of `service`.
    pub async fn state(&self, service: &str) -> Result<CircuitState, StoreError> {
        if let Some(open) = self.open_snapshot(service).await? {
            return Ok(open);
        }
        Ok(CircuitState {
            is_open: false,
            failure_count: self.failure_count(service).await?,
        })
    }

    async fn open_snapshot(&self, service: &str) -> Result<Option<CircuitState>, StoreError> {
        let key = keys::circuit(service);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let state: CircuitState = serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
            key,
            reason: err.to_string(),
        })?;
        Ok(state.is_open.then_some(state))
    }

    async fn failure_count(&self, service: &str) -> Result<u32, StoreError> {
        let key = keys::failures(service);
        match self.store.get(&key).await? {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| StoreError::Corrupt {
                key,
                reason: format!("not a counter: {raw:?}"),
            }),
        }
    }
}

fn encode(key: &str, state: &CircuitState) -> Result<String, StoreError> {
    serde_json::to_string(state).map_err(|err| StoreError::Corrupt {
        key: key.to_string(),
        reason: err.to_string(),
    })
}
