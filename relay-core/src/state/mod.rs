//! Shared state store seam.
//!
//! Circuit state, failure counters, load balancer cursors and cached instance
//! snapshots all live behind [`StateStore`]. In production this is Redis and is
//! shared by every gateway process; in tests it is a [`MemoryStore`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;

pub use memory::MemoryStore;

/// Errors raised by a state store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not serve the command.
    #[error("state store backend error: {0}")]
    Backend(String),
    /// A stored value could not be decoded into the expected shape.
    #[error("corrupt value under '{key}': {reason}")]
    Corrupt {
        /// Key holding the undecodable value.
        key: String,
        /// Decoder message.
        reason: String,
    },
}

/// A distributed key-value store with per-key expiry.
///
/// All operations must be safe under concurrent use from many gateway processes.
/// Last write wins; callers tolerate races.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Read `key`. Expired and missing keys both read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `key`, replacing any previous value. `ttl = None` never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Key namespace for per-service shared state.
pub mod keys {
    /// Open/closed snapshot of a service's circuit.
    pub fn circuit(service: &str) -> String {
        format!("circuit:{service}")
    }

    /// Failure counter of the current observation window.
    pub fn failures(service: &str) -> String {
        format!("failures:{service}")
    }

    /// Round-robin cursor.
    pub fn load_balancer(service: &str) -> String {
        format!("loadBalancer:{service}")
    }

    /// Cached instance snapshot.
    pub fn instances(service: &str) -> String {
        format!("instances:{service}")
    }
}
