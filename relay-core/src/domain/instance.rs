//! Backend instance models.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One healthy backend endpoint of a logical service.
///
/// Instances are value objects. A resolved list is a snapshot and is replaced
/// wholesale on refresh, never mutated in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Host name or IP address of the instance.
    pub address: String,
    /// TCP port the instance listens on.
    pub port: u16,
}

impl ServiceInstance {
    /// Create a new instance for `address:port`.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// The `host:port` authority used for connecting and for the `Host` header.
    pub fn authority(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            // bare IPv6 literal
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_brackets_ipv6_literals() {
        assert_eq!(ServiceInstance::new("10.0.0.1", 8080).authority(), "10.0.0.1:8080");
        assert_eq!(ServiceInstance::new("::1", 9000).authority(), "[::1]:9000");
        assert_eq!(ServiceInstance::new("orders.internal", 80).to_string(), "orders.internal:80");
    }
}
