//! Process-local map from service name to its proxy handle.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use relay_core::ServiceInstance;
use tokio::sync::OnceCell;

use super::ProxyHandle;

type Slot = Arc<OnceCell<Arc<ProxyHandle>>>;

/// Lazily populated proxy handles, one per service.
///
/// Population of a slot is single-flight: concurrent first requests for the
/// same service wait on one build instead of each constructing a handle.
/// Requests for different services never wait on each other. Handles are kept
/// until explicitly evicted.
#[derive(Debug, Default)]
pub struct ProxyCache {
    slots: DashMap<String, Slot>,
}

impl ProxyCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached handle of `service`, if one has been built.
    pub fn get(&self, service: &str) -> Option<Arc<ProxyHandle>> {
        self.slots.get(service)?.get().cloned()
    }

    /// Return the cached handle of `service`, running `build` if there is none.
    ///
    /// A failed build drops the slot, so the next caller builds again.
    pub async fn get_or_try_build<F, Fut, E>(&self, service: &str, build: F) -> Result<Arc<ProxyHandle>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ProxyHandle, E>>,
    {
        if let Some(handle) = self.get(service) {
            return Ok(handle);
        }
        let slot = self.slots.entry(service.to_string()).or_default().clone();
        match slot
            .get_or_try_init(|| async { build().await.map(Arc::new) })
            .await
        {
            Ok(handle) => Ok(handle.clone()),
            Err(err) => {
                // unknown services must not leave empty slots behind
                self.slots.remove_if(service, |_, current| {
                    Arc::ptr_eq(current, &slot) && !current.initialized()
                });
                Err(err)
            }
        }
    }

    /// Drop the handle of `service`, returning it if one was cached.
    pub fn invalidate(&self, service: &str) -> Option<Arc<ProxyHandle>> {
        self.slots
            .remove(service)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    /// Drop the handle of `service` only if it is still `handle`.
    ///
    /// Returns false when the slot already holds a newer handle or is gone.
    pub fn evict_if_current(&self, service: &str, handle: &Arc<ProxyHandle>) -> bool {
        self.slots
            .remove_if(service, |_, slot| {
                slot.get().is_some_and(|cached| Arc::ptr_eq(cached, handle))
            })
            .is_some()
    }

    /// Target instance of the cached handle of `service`.
    pub fn target(&self, service: &str) -> Option<ServiceInstance> {
        self.get(service).map(|handle| handle.target().clone())
    }

    /// Every built handle, keyed by service.
    pub fn snapshot(&self) -> Vec<(String, Arc<ProxyHandle>)> {
        self.slots
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .get()
                    .map(|handle| (entry.key().clone(), handle.clone()))
            })
            .collect()
    }

    /// Number of built handles.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|entry| entry.value().initialized()).count()
    }

    /// True when no handle has been built.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
