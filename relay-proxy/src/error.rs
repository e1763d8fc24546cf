//! Error taxonomy of the dispatch pipeline.

use std::io;
use std::time::Duration;

use hyper::StatusCode;
use relay_core::ResolutionError;
use thiserror::Error;

/// Failure while forwarding one request to a chosen instance.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// TCP connect to the instance failed.
    #[error("connect to {target} failed: {source}")]
    Connect {
        /// `host:port` of the instance.
        target: String,
        /// Socket error.
        #[source]
        source: io::Error,
    },
    /// HTTP/1 handshake with the instance failed.
    #[error("handshake with {target} failed: {source}")]
    Handshake {
        /// `host:port` of the instance.
        target: String,
        /// Protocol error.
        #[source]
        source: hyper::Error,
    },
    /// The request could not be sent or no response head arrived.
    #[error("request to {target} failed: {source}")]
    Send {
        /// `host:port` of the instance.
        target: String,
        /// Protocol error.
        #[source]
        source: hyper::Error,
    },
    /// The instance did not answer within the forwarding budget.
    #[error("no response from {target} within {timeout:?}")]
    Timeout {
        /// `host:port` of the instance.
        target: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// The inbound request could not be rewritten for the upstream.
    #[error("cannot rewrite request for upstream: {0}")]
    InvalidRequest(String),
}

/// Typed failure of [`crate::dispatcher::Dispatcher::dispatch`].
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The circuit of the service is open. No network I/O was attempted.
    #[error("service '{service}' is unavailable: circuit open")]
    ServiceUnavailable {
        /// Rejected service.
        service: String,
    },
    /// No instance of the service could be found.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
    /// The chosen instance failed to serve the request.
    #[error("upstream for service '{service}' failed: {source}")]
    UpstreamForwarding {
        /// Target service.
        service: String,
        /// Underlying forwarding failure.
        #[source]
        source: ForwardError,
    },
    /// The chosen instance did not answer in time.
    #[error("upstream for service '{service}' timed out after {timeout:?}")]
    UpstreamTimeout {
        /// Target service.
        service: String,
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// A defect in the pipeline itself.
    #[error("internal gateway error: {0}")]
    Internal(String),
}

impl DispatchError {
    /// Classify a forwarding failure for `service`.
    pub fn from_forward(service: &str, err: ForwardError) -> Self {
        match err {
            ForwardError::Timeout { timeout, .. } => Self::UpstreamTimeout {
                service: service.to_string(),
                timeout,
            },
            ForwardError::InvalidRequest(reason) => Self::Internal(reason),
            source => Self::UpstreamForwarding {
                service: service.to_string(),
                source,
            },
        }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ServiceUnavailable { .. } => "service_unavailable",
            Self::Resolution(_) => "resolution_failed",
            Self::UpstreamForwarding { .. } => "upstream_failed",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status the routing layer answers with.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ServiceUnavailable { .. } | Self::Resolution(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamForwarding { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_errors_map_to_gateway_statuses() {
        let timeout = DispatchError::from_forward(
            "billing",
            ForwardError::Timeout {
                target: "10.0.0.1:80".to_string(),
                timeout: Duration::from_secs(1),
            },
        );
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(timeout.kind(), "upstream_timeout");

        let refused = DispatchError::from_forward(
            "billing",
            ForwardError::Connect {
                target: "10.0.0.1:80".to_string(),
                source: io::Error::from(io::ErrorKind::ConnectionRefused),
            },
        );
        assert_eq!(refused.status(), StatusCode::BAD_GATEWAY);

        let unavailable = DispatchError::ServiceUnavailable {
            service: "billing".to_string(),
        };
        assert_eq!(unavailable.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resolution =
            DispatchError::from(ResolutionError::NoHealthyInstance("billing".to_string()));
        assert_eq!(resolution.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resolution.kind(), "resolution_failed");
    }
}
