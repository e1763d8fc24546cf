//! Lock-free hot pool implementation using DashMap and SegQueue.

use std::sync::Arc;

use crossbeam_queue::SegQueue;
use dashmap::DashMap;
use hyper::client::conn::http1::SendRequest;

use crate::body::ProxyBody;

/// A lock-free pool of idle HTTP/1.1 upstream connections.
///
/// Shared by every proxy handle of the process, so a handle rebuilt for the
/// same `host:port` after an invalidation reuses the warm connections.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPool {
    /// Maps an upstream authority to a lock-free queue of idle senders.
    idle_connections: Arc<DashMap<String, Arc<SegQueue<SendRequest<ProxyBody>>>>>,
}

impl ConnectionPool {
    /// Creates a new empty connection pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pops an idle sender for `authority` that can take a request right now.
    ///
    /// Closed senders are discarded. Senders still streaming a previous
    /// response are dropped as well; their connection finishes that response
    /// and then shuts down.
    pub fn try_pop(&self, authority: &str) -> Option<SendRequest<ProxyBody>> {
        let queue = self.idle_connections.get(authority)?.value().clone();
        while let Some(sender) = queue.pop() {
            if !sender.is_closed() && sender.is_ready() {
                return Some(sender);
            }
        }
        None
    }

    /// Pushes a sender back into the pool for reuse.
    pub fn push(&self, authority: &str, sender: SendRequest<ProxyBody>) {
        if sender.is_closed() {
            return;
        }

        let queue = self
            .idle_connections
            .entry(authority.to_string())
            .or_insert_with(|| Arc::new(SegQueue::new()))
            .value()
            .clone();

        queue.push(sender);
    }
}
