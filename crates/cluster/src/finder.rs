// Peer discovery
// Decision: Finders only produce seed addresses; gossip does the rest

use async_trait::async_trait;

use crate::error::BusError;

/// Produces addresses of candidate peers
#[async_trait]
pub trait PeerFinder: Send + Sync {
    async fn find(&self) -> Result<Vec<String>, BusError>;
}

/// Fixed peer list
#[derive(Debug, Clone, Default)]
pub struct StaticFinder {
    addresses: Vec<String>,
}

impl StaticFinder {
    pub fn new(addresses: Vec<String>) -> Self {
        Self { addresses }
    }
}

#[async_trait]
impl PeerFinder for StaticFinder {
    async fn find(&self) -> Result<Vec<String>, BusError> {
        Ok(self.addresses.clone())
    }
}

/// Resolves a (headless) service name to one address per backing pod
#[derive(Debug, Clone)]
pub struct DnsFinder {
    service: String,
    port: u16,
}

impl DnsFinder {
    pub fn new(service: impl Into<String>, port: u16) -> Self {
        Self {
            service: service.into(),
            port,
        }
    }
}

#[async_trait]
impl PeerFinder for DnsFinder {
    async fn find(&self) -> Result<Vec<String>, BusError> {
        let addrs = tokio::net::lookup_host((self.service.as_str(), self.port))
            .await
            .map_err(|e| BusError::Discovery(format!("{}: {e}", self.service)))?;
        let mut out: Vec<String> = addrs.map(|a| a.to_string()).collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_finder() {
        let f = StaticFinder::new(vec!["10.0.0.1:4150".into()]);
        assert_eq!(f.find().await.unwrap(), vec!["10.0.0.1:4150".to_string()]);
    }

    #[tokio::test]
    async fn test_dns_finder_resolves_localhost() {
        let found = DnsFinder::new("localhost", 4150).find().await.unwrap();
        assert!(!found.is_empty());
        assert!(found.iter().all(|a| a.ends_with(":4150")));
    }
}
