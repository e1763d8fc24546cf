//! Per-service forwarding handlers and their process-local cache.

mod cache;
mod handle;

pub use cache::ProxyCache;
pub use handle::{ClientAddr, ProxyHandle};
