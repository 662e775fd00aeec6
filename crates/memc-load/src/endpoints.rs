//! Device type to cache endpoint routing

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::memcache::{CacheClient, MemcacheClient};

/// A resolved write target: address for logs, client for I/O
#[derive(Clone)]
pub struct Endpoint {
    pub address: String,
    pub client: Arc<dyn CacheClient>,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Read-only routing table, built once per run and shared by every stage.
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    endpoints: HashMap<String, Endpoint>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// One pooled memcached client per configured device type.
    pub fn connect(
        device_endpoints: &BTreeMap<String, String>,
        pool_size: usize,
        io_timeout: Duration,
    ) -> Self {
        let mut table = Self::new();
        for (device_type, address) in device_endpoints {
            let client = MemcacheClient::new(address.clone(), pool_size, io_timeout);
            table.insert(device_type.clone(), address.clone(), Arc::new(client));
        }
        table
    }

    pub fn insert(
        &mut self,
        device_type: impl Into<String>,
        address: impl Into<String>,
        client: Arc<dyn CacheClient>,
    ) {
        self.endpoints.insert(
            device_type.into(),
            Endpoint {
                address: address.into(),
                client,
            },
        );
    }

    /// Look up the endpoint for a device type; `None` means the line has no destination.
    pub fn resolve(&self, device_type: &str) -> Option<&Endpoint> {
        self.endpoints.get(device_type)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_and_unknown_types() {
        let endpoints = BTreeMap::from([
            ("idfa".to_string(), "127.0.0.1:33013".to_string()),
            ("gaid".to_string(), "127.0.0.1:33014".to_string()),
        ]);
        let table = EndpointTable::connect(&endpoints, 2, Duration::from_millis(100));

        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve("idfa").unwrap().address, "127.0.0.1:33013");
        assert_eq!(table.resolve("gaid").unwrap().address, "127.0.0.1:33014");
        assert!(table.resolve("dvid").is_none());
        assert!(table.resolve("IDFA").is_none());
    }
}
