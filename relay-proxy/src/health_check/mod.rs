//! Active health checking of cached proxy targets.

mod prober;

pub use prober::{probe_cached_targets, spawn_health_checker, PROBE_TIMEOUT};
