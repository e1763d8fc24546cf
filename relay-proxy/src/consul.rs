//! Consul-backed [`ServiceRegistry`].

use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use relay_core::{HealthCheck, RegistryEntry, RegistryError, ServiceRegistry};
use serde::Deserialize;
use tracing::debug;

const TOKEN_HEADER: &str = "x-consul-token";

/// Queries `/v1/health/service/{name}` on a Consul agent.
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    base_url: String,
    token: Option<String>,
    timeout: Duration,
    client: Client<HttpConnector, Empty<Bytes>>,
}

impl ConsulRegistry {
    /// Create a client for the agent at `base_url`, e.g. `http://127.0.0.1:8500`.
    pub fn new(base_url: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            token,
            timeout,
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    async fn fetch(&self, service: &str) -> Result<(StatusCode, Bytes), RegistryError> {
        let uri = format!("{}/v1/health/service/{}", self.base_url, service);
        let mut builder = Request::get(uri);
        if let Some(token) = &self.token {
            builder = builder.header(TOKEN_HEADER, token);
        }
        let request = builder
            .body(Empty::new())
            .map_err(|err| RegistryError::Unreachable(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| RegistryError::Unreachable(err.to_string()))?;
        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|err| RegistryError::Unreachable(err.to_string()))?
            .to_bytes();
        Ok((status, body))
    }
}

#[async_trait]
impl ServiceRegistry for ConsulRegistry {
    async fn query_health(&self, service: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        let (status, body) = tokio::time::timeout(self.timeout, self.fetch(service))
            .await
            .map_err(|_| RegistryError::Timeout)??;
        if !status.is_success() {
            return Err(RegistryError::Status {
                service: service.to_string(),
                status: status.as_u16(),
            });
        }
        let entries = parse_health_response(&body)?;
        debug!(service, entries = entries.len(), "consul health query");
        Ok(entries)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    #[serde(default)]
    node: NodeInfo,
    service: ServiceInfo,
    #[serde(default)]
    checks: Vec<CheckInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeInfo {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceInfo {
    #[serde(default)]
    address: String,
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CheckInfo {
    status: String,
}

/// Decode a Consul health endpoint payload.
///
/// An empty service address falls back to the node address.
pub fn parse_health_response(body: &[u8]) -> Result<Vec<RegistryEntry>, RegistryError> {
    let entries: Vec<HealthEntry> =
        serde_json::from_slice(body).map_err(|err| RegistryError::Decode(err.to_string()))?;
    Ok(entries
        .into_iter()
        .map(|entry| {
            let address = if entry.service.address.is_empty() {
                entry.node.address
            } else {
                entry.service.address
            };
            RegistryEntry {
                address,
                port: entry.service.port,
                checks: entry
                    .checks
                    .into_iter()
                    .map(|check| HealthCheck {
                        status: check.status,
                    })
                    .collect(),
            }
        })
        .collect())
}
