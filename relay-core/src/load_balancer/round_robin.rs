//! Round-robin selection with a cursor persisted in the shared state store.
//!
//! The cursor read-modify-write is not atomic across callers. Two concurrent
//! picks for the same service can read the same index and return the same
//! instance, so rotation is only approximately fair under load. Sequential
//! callers observe exact round-robin order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::instance::ServiceInstance;
use crate::state::{keys, StateStore, StoreError};

/// Errors raised while picking an instance.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// The caller supplied no candidates.
    #[error("no instances to balance across for service '{0}'")]
    NoInstances(String),
    /// The cursor could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted rotation state of one service.
///
/// `index` is always below `instances.len()` when `instances` is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerCursor {
    /// Position of the instance returned by the last pick.
    pub index: usize,
    /// Snapshot the index refers to.
    pub instances: Vec<ServiceInstance>,
}

/// Stateful round-robin selector.
#[derive(Clone)]
pub struct RoundRobin {
    store: Arc<dyn StateStore>,
}

impl RoundRobin {
    /// Build a selector whose cursors live in `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Advance the cursor of `service` and return the instance it lands on.
    pub async fn next_instance(
        &self,
        service: &str,
        instances: &[ServiceInstance],
    ) -> Result<ServiceInstance, BalancerError> {
        if instances.is_empty() {
            return Err(BalancerError::NoInstances(service.to_string()));
        }

        let key = keys::load_balancer(service);
        let current = self.cursor(&key).await?.map_or(0, |cursor| cursor.index);
        // stored index may come from a longer list or another writer
        let index = (current % instances.len() + 1) % instances.len();

        let cursor = LoadBalancerCursor {
            index,
            instances: instances.to_vec(),
        };
        let encoded = serde_json::to_string(&cursor).map_err(|err| StoreError::Corrupt {
            key: key.clone(),
            reason: err.to_string(),
        })?;
        self.store.set(&key, &encoded, None).await?;

        let picked = instances[index].clone();
        debug!(service, index, instance = %picked, "round-robin pick");
        Ok(picked)
    }

    async fn cursor(&self, key: &str) -> Result<Option<LoadBalancerCursor>, StoreError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(cursor) => Ok(Some(cursor)),
            Err(err) => {
                warn!(key, error = %err, "resetting undecodable load balancer cursor");
                Ok(None)
            }
        }
    }
}
