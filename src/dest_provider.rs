use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use regex::{Regex, RegexBuilder};

use crate::address::{Address, NetLocation};
use crate::ngrok::{EndpointInventory, TunnelEndpoint};

/// Yields the stream endpoint the client engine should connect to. Called
/// once per outbound connection attempt; the result may differ between
/// attempts, so callers must not cache it across reconnects.
#[async_trait]
pub trait DestProvider: Send + Sync {
    async fn resolve(&self) -> std::io::Result<SocketAddr>;
}

/// The configured endpoint, verbatim.
pub struct StaticDest {
    location: NetLocation,
}

impl StaticDest {
    pub fn new(location: NetLocation) -> Self {
        Self { location }
    }
}

#[async_trait]
impl DestProvider for StaticDest {
    async fn resolve(&self) -> std::io::Result<SocketAddr> {
        self.location.resolve().await
    }
}

/// Picks the first inventory entry whose id matches the filter exactly, or
/// whose URI matches it as a case-insensitive regular expression.
pub struct NgrokDest {
    inventory: Arc<dyn EndpointInventory>,
    filter: String,
    uri_pattern: Option<Regex>,
}

impl NgrokDest {
    pub fn new(inventory: Arc<dyn EndpointInventory>, filter: String) -> Self {
        let uri_pattern = RegexBuilder::new(&filter)
            .case_insensitive(true)
            .build()
            .ok();
        Self {
            inventory,
            filter,
            uri_pattern,
        }
    }

    fn matches(&self, endpoint: &TunnelEndpoint) -> bool {
        if endpoint.id == self.filter {
            return true;
        }
        match self.uri_pattern {
            Some(ref pattern) => pattern.is_match(&endpoint.uri()),
            None => false,
        }
    }
}

#[async_trait]
impl DestProvider for NgrokDest {
    async fn resolve(&self) -> std::io::Result<SocketAddr> {
        let endpoints = self.inventory.list_endpoints().await?;
        let endpoint = endpoints
            .iter()
            .find(|endpoint| self.matches(endpoint))
            .ok_or_else(|| {
                std::io::Error::other(format!(
                    "no inventory endpoint matches {:?}",
                    self.filter
                ))
            })?;

        debug!("picked endpoint {} ({})", endpoint.id, endpoint.uri());

        let (host, port) = endpoint.host_port()?;
        NetLocation::new(Address::from(host)?, port).resolve().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedInventory(Vec<TunnelEndpoint>);

    #[async_trait]
    impl EndpointInventory for FixedInventory {
        async fn list_endpoints(&self) -> std::io::Result<Vec<TunnelEndpoint>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenInventory;

    #[async_trait]
    impl EndpointInventory for BrokenInventory {
        async fn list_endpoints(&self) -> std::io::Result<Vec<TunnelEndpoint>> {
            Err(std::io::Error::other("listing unavailable"))
        }
    }

    fn endpoint(id: &str, hostport: &str) -> TunnelEndpoint {
        serde_json::from_str(&format!(
            r#"{{"id":"{}","proto":"tcp","hostport":"{}","type":"ephemeral"}}"#,
            id, hostport
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_static_returns_configured_endpoint() {
        let provider = StaticDest::new(NetLocation::from_str("127.0.0.1:12345", None).unwrap());
        assert_eq!(
            provider.resolve().await.unwrap(),
            "127.0.0.1:12345".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_exact_id_match() {
        let inventory = Arc::new(FixedInventory(vec![
            endpoint("ep_1", "127.0.0.1:1111"),
            endpoint("ep_2", "127.0.0.2:2222"),
        ]));
        let provider = NgrokDest::new(inventory, "ep_2".to_string());
        assert_eq!(
            provider.resolve().await.unwrap(),
            "127.0.0.2:2222".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_uri_regex_match_is_case_insensitive() {
        let inventory = Arc::new(FixedInventory(vec![
            endpoint("ep_1", "127.0.0.1:1111"),
            endpoint("ep_2", "127.0.0.2:2222"),
        ]));
        let provider = NgrokDest::new(inventory, r"TCP://127\.0\.0\.2".to_string());
        assert_eq!(
            provider.resolve().await.unwrap(),
            "127.0.0.2:2222".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let inventory = Arc::new(FixedInventory(vec![
            endpoint("ep_1", "127.0.0.1:1111"),
            endpoint("ep_2", "127.0.0.1:2222"),
        ]));
        let provider = NgrokDest::new(inventory, "tcp://.*".to_string());
        assert_eq!(
            provider.resolve().await.unwrap(),
            "127.0.0.1:1111".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_no_match_fails() {
        let inventory = Arc::new(FixedInventory(vec![endpoint("ep_1", "127.0.0.1:1111")]));
        let provider = NgrokDest::new(inventory, "ep_9".to_string());
        assert!(provider.resolve().await.is_err());
    }

    #[tokio::test]
    async fn test_listing_failure_propagates() {
        let provider = NgrokDest::new(Arc::new(BrokenInventory), "ep_1".to_string());
        assert!(provider.resolve().await.is_err());
    }
}
