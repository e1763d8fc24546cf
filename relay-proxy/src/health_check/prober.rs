//! Background prober for active TCP health checks.
//!
//! Cached proxy handles are never re-validated on the request path. When this
//! prober is enabled it connects to every cached target on an interval and
//! evicts the handles whose target no longer accepts connections, so the next
//! request for those services re-resolves.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;

/// Budget for a single TCP probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1500);

/// Spawns a background Tokio task that probes cached targets every `interval`.
pub fn spawn_health_checker(dispatcher: Arc<Dispatcher>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);

        // Prevent immediately ticking when spawned
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let evicted = probe_cached_targets(&dispatcher, PROBE_TIMEOUT).await;
            debug!(evicted, "health probe round finished");
        }
    })
}

/// Probe every cached target once, evicting the unreachable ones.
///
/// Returns how many handles were evicted.
pub async fn probe_cached_targets(dispatcher: &Dispatcher, probe_timeout: Duration) -> usize {
    let mut evicted = 0;
    for (service, handle) in dispatcher.proxies().snapshot() {
        let target = handle.target();
        let reachable = matches!(
            time::timeout(
                probe_timeout,
                TcpStream::connect((target.address.as_str(), target.port))
            )
            .await,
            Ok(Ok(_))
        );

        if reachable {
            continue;
        }
        warn!(service = %service, upstream = %target, "cached target unreachable, evicting");
        if dispatcher.evict(&service, &handle).await {
            evicted += 1;
        }
    }
    evicted
}
