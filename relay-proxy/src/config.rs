//! Command line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use relay_core::{BreakerConfig, ResolverConfig, ServiceInstance};
use thiserror::Error;

use crate::dispatcher::DispatchConfig;

/// Rejected configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `--static-instance` value is not `service=host:port`.
    #[error("invalid static instance '{0}', expected service=host:port")]
    InvalidStaticInstance(String),
    /// A numeric setting is out of range.
    #[error("invalid {field}: {reason}")]
    OutOfRange {
        /// Offending flag.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Raw command line of the `relay` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "relay", version, about = "Resilient dynamic API gateway")]
pub struct Cli {
    /// Address the gateway listens on.
    #[arg(long, env = "RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Redis URL for shared state. Without it state is kept in process memory.
    #[arg(long, env = "RELAY_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Prefix applied to every Redis key.
    #[arg(long, env = "RELAY_REDIS_PREFIX", default_value = "relay")]
    pub redis_prefix: String,

    /// Consul agent HTTP address.
    #[arg(long, env = "RELAY_CONSUL_ADDR", default_value = "http://127.0.0.1:8500")]
    pub consul_addr: String,

    /// Consul ACL token.
    #[arg(long, env = "RELAY_CONSUL_TOKEN")]
    pub consul_token: Option<String>,

    /// Budget for one registry query, in milliseconds.
    #[arg(long, env = "RELAY_REGISTRY_TIMEOUT_MS", default_value_t = 2_000)]
    pub registry_timeout_ms: u64,

    /// Fixed `service=host:port` instances. Replaces Consul when given.
    #[arg(long = "static-instance", env = "RELAY_STATIC_INSTANCES", value_delimiter = ',')]
    pub static_instances: Vec<String>,

    /// Failures that open a service's circuit.
    #[arg(long, env = "RELAY_FAILURE_THRESHOLD", default_value_t = 5)]
    pub failure_threshold: u32,

    /// Seconds an open circuit (and a failure window) lasts.
    #[arg(long, env = "RELAY_RECOVERY_TIMEOUT_SECONDS", default_value_t = 30)]
    pub recovery_timeout_seconds: u64,

    /// Seconds a resolved instance list stays cached.
    #[arg(long, env = "RELAY_INSTANCE_CACHE_TTL_SECONDS", default_value_t = 30)]
    pub instance_cache_ttl_seconds: u64,

    /// Resolve only the first healthy instance of each service.
    #[arg(long, env = "RELAY_FIRST_HEALTHY_ONLY")]
    pub first_healthy_only: bool,

    /// Budget for one upstream forward, in milliseconds.
    #[arg(long, env = "RELAY_UPSTREAM_TIMEOUT_MS", default_value_t = 30_000)]
    pub upstream_timeout_ms: u64,

    /// Keep failure counters after successful forwards.
    #[arg(long, env = "RELAY_KEEP_FAILURES_ON_SUCCESS")]
    pub keep_failures_on_success: bool,

    /// Probe cached proxy targets at this interval and evict dead ones.
    #[arg(long, env = "RELAY_HEALTH_PROBE_INTERVAL_MS")]
    pub health_probe_interval_ms: Option<u64>,

    /// Unix socket path for the admin control plane.
    #[arg(long, env = "RELAY_ADMIN_SOCKET")]
    pub admin_socket: Option<PathBuf>,

    /// Log at debug level.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Where shared state lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreBackend {
    /// Process memory. Only correct for a single gateway process.
    Memory,
    /// A Redis server.
    Redis {
        /// Connection URL.
        url: String,
        /// Key prefix.
        prefix: String,
    },
}

/// Where instances are discovered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryBackend {
    /// A fixed topology.
    Static(Vec<(String, ServiceInstance)>),
    /// A Consul agent.
    Consul {
        /// Agent HTTP address.
        address: String,
        /// ACL token.
        token: Option<String>,
        /// Budget for one query.
        timeout: Duration,
    },
}

/// Validated gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listen address.
    pub listen: SocketAddr,
    /// Shared state backend.
    pub store: StoreBackend,
    /// Discovery backend.
    pub registry: RegistryBackend,
    /// Breaker tunables.
    pub breaker: BreakerConfig,
    /// Resolver tunables.
    pub resolver: ResolverConfig,
    /// Dispatcher tunables.
    pub dispatch: DispatchConfig,
    /// Health probe interval, when probing is enabled.
    pub health_probe_interval: Option<Duration>,
    /// Admin socket path, when the control plane is enabled.
    pub admin_socket: Option<PathBuf>,
}

impl TryFrom<Cli> for GatewayConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.failure_threshold == 0 {
            return Err(ConfigError::OutOfRange {
                field: "failure threshold",
                reason: "must be at least 1",
            });
        }
        let recovery_timeout = positive_secs("recovery timeout", cli.recovery_timeout_seconds)?;
        let cache_ttl = positive_secs("instance cache ttl", cli.instance_cache_ttl_seconds)?;
        let upstream_timeout = positive_millis("upstream timeout", cli.upstream_timeout_ms)?;
        let registry_timeout = positive_millis("registry timeout", cli.registry_timeout_ms)?;
        let health_probe_interval = cli
            .health_probe_interval_ms
            .map(|ms| positive_millis("health probe interval", ms))
            .transpose()?;

        let store = match cli.redis_url {
            Some(url) => StoreBackend::Redis {
                url,
                prefix: cli.redis_prefix,
            },
            None => StoreBackend::Memory,
        };

        let registry = if cli.static_instances.is_empty() {
            RegistryBackend::Consul {
                address: cli.consul_addr,
                token: cli.consul_token,
                timeout: registry_timeout,
            }
        } else {
            let instances = cli
                .static_instances
                .iter()
                .map(|raw| parse_static_instance(raw))
                .collect::<Result<Vec<_>, _>>()?;
            RegistryBackend::Static(instances)
        };

        Ok(Self {
            listen: cli.listen,
            store,
            registry,
            breaker: BreakerConfig {
                failure_threshold: cli.failure_threshold,
                recovery_timeout,
            },
            resolver: ResolverConfig {
                cache_ttl,
                first_healthy_only: cli.first_healthy_only,
            },
            dispatch: DispatchConfig {
                upstream_timeout,
                reset_failures_on_success: !cli.keep_failures_on_success,
            },
            health_probe_interval,
            admin_socket: cli.admin_socket,
        })
    }
}

fn positive_secs(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    positive_millis(field, value).map(|_| Duration::from_secs(value))
}

fn positive_millis(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            field,
            reason: "must be greater than zero",
        });
    }
    Ok(Duration::from_millis(value))
}

/// Parse `service=host:port`.
pub fn parse_static_instance(raw: &str) -> Result<(String, ServiceInstance), ConfigError> {
    let invalid = || ConfigError::InvalidStaticInstance(raw.to_string());
    let (service, target) = raw.trim().split_once('=').ok_or_else(invalid)?;
    let (host, port) = target.rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port.parse().map_err(|_| invalid())?;
    if service.is_empty() || host.is_empty() {
        return Err(invalid());
    }
    Ok((service.to_string(), ServiceInstance::new(host, port)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<GatewayConfig, ConfigError> {
        let cli = Cli::try_parse_from(std::iter::once("relay").chain(args.iter().copied()))
            .unwrap();
        GatewayConfig::try_from(cli)
    }

    #[test]
    fn defaults_match_the_documented_tunables() {
        let config = parse(&[]).unwrap();

        assert_eq!(config.breaker, BreakerConfig::default());
        assert_eq!(config.resolver, ResolverConfig::default());
        assert_eq!(config.dispatch, DispatchConfig::default());
        assert_eq!(config.store, StoreBackend::Memory);
        assert!(matches!(config.registry, RegistryBackend::Consul { .. }));
        assert_eq!(config.health_probe_interval, None);
    }

    #[test]
    fn static_instances_replace_consul() {
        let config = parse(&[
            "--static-instance",
            "orders=10.0.0.1:8080,orders=10.0.0.2:8080",
            "--static-instance",
            "billing=[::1]:9000",
            "--redis-url",
            "redis://cache:6379",
        ])
        .unwrap();

        assert_eq!(
            config.registry,
            RegistryBackend::Static(vec![
                ("orders".to_string(), ServiceInstance::new("10.0.0.1", 8080)),
                ("orders".to_string(), ServiceInstance::new("10.0.0.2", 8080)),
                ("billing".to_string(), ServiceInstance::new("::1", 9000)),
            ])
        );
        assert!(matches!(config.store, StoreBackend::Redis { ref prefix, .. } if prefix == "relay"));
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(matches!(
            parse(&["--failure-threshold", "0"]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse(&["--upstream-timeout-ms", "0"]),
            Err(ConfigError::OutOfRange { .. })
        ));
        assert!(matches!(
            parse(&["--static-instance", "orders"]),
            Err(ConfigError::InvalidStaticInstance(_))
        ));
        assert!(parse_static_instance("orders=host:http").is_err());
    }

    #[test]
    fn tuning_flags_are_applied() {
        let config = parse(&[
            "--failure-threshold",
            "3",
            "--recovery-timeout-seconds",
            "10",
            "--first-healthy-only",
            "--keep-failures-on-success",
            "--health-probe-interval-ms",
            "500",
        ])
        .unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.recovery_timeout, Duration::from_secs(10));
        assert!(config.resolver.first_healthy_only);
        assert!(!config.dispatch.reset_failures_on_success);
        assert_eq!(config.health_probe_interval, Some(Duration::from_millis(500)));
    }
}
