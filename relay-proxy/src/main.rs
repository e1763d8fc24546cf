//! Relay Gateway
//!
//! Parses configuration, wires the shared state store and service registry into
//! the dispatcher, and serves HTTP until interrupted.

use std::collections::BTreeMap;
use std::sync::Arc;

use clap::Parser;
use relay_admin::ControlPlane;
use relay_core::{
    CircuitBreaker, InstanceResolver, MemoryStore, RegistryEntry, RoundRobin, ServiceRegistry,
    StateStore, StaticRegistry,
};
use relay_proxy::config::{Cli, GatewayConfig, RegistryBackend, StoreBackend};
use relay_proxy::consul::ConsulRegistry;
use relay_proxy::health_check::spawn_health_checker;
use relay_proxy::redis_store::RedisStore;
use relay_proxy::{server, Dispatcher};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The primary entrypoint for the Relay gateway.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = GatewayConfig::try_from(cli)?;
    info!("Starting Relay gateway...");

    let store: Arc<dyn StateStore> = match &config.store {
        StoreBackend::Memory => {
            warn!("no redis url configured, shared state is local to this process");
            Arc::new(MemoryStore::new())
        }
        StoreBackend::Redis { url, prefix } => Arc::new(RedisStore::connect(url, prefix.clone()).await?),
    };

    let registry: Arc<dyn ServiceRegistry> = match &config.registry {
        RegistryBackend::Static(instances) => {
            let mut grouped: BTreeMap<&str, Vec<RegistryEntry>> = BTreeMap::new();
            for (service, instance) in instances {
                grouped
                    .entry(service.as_str())
                    .or_default()
                    .push(RegistryEntry::healthy(instance.address.clone(), instance.port));
            }
            let registry = StaticRegistry::new();
            for (service, entries) in grouped {
                registry.set_service(service, entries);
            }
            info!(services = ?registry.services(), "using static registry");
            Arc::new(registry)
        }
        RegistryBackend::Consul {
            address,
            token,
            timeout,
        } => {
            info!(%address, "using consul registry");
            Arc::new(ConsulRegistry::new(address.clone(), token.clone(), *timeout))
        }
    };

    let dispatcher = Arc::new(Dispatcher::new(
        CircuitBreaker::new(store.clone(), config.breaker),
        InstanceResolver::new(registry, store.clone(), config.resolver),
        RoundRobin::new(store),
        config.dispatch,
    ));
    let breaker = dispatcher.breaker().config();
    info!(
        threshold = breaker.failure_threshold,
        recovery_secs = breaker.recovery_timeout.as_secs(),
        "circuit breaker configured"
    );

    if let Some(interval) = config.health_probe_interval {
        info!(interval_ms = interval.as_millis() as u64, "health prober enabled");
        spawn_health_checker(dispatcher.clone(), interval);
    }

    if let Some(path) = config.admin_socket.clone() {
        let control: Arc<dyn ControlPlane> = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_admin::serve(path, control).await {
                error!("Admin control plane failed: {}", e);
            }
        });
    }

    tokio::select! {
        result = server::start_server(config.listen, dispatcher) => {
            if let Err(e) = result {
                error!("Server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    info!("Shutting down gracefully.");
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
