//! Shared registry clients, one per (host, credential).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use promo_core::RegistryName;

use crate::client::RegistryClient;
use crate::reference::RegistryEndpoint;

/// Clients are reused across edges and scans. Registries on the same host
/// with the same token share one client (and its anonymous token cache).
#[derive(Debug)]
pub struct RegistryPool {
    timeout: Duration,
    tokens: RwLock<HashMap<RegistryName, Option<String>>>,
    clients: RwLock<HashMap<(String, Option<String>), Arc<RegistryClient>>>,
}

impl RegistryPool {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            tokens: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Token used for every later request against `registry`.
    pub fn set_token(&self, registry: &RegistryName, token: Option<String>) {
        self.tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(registry.clone(), token);
    }

    pub fn client(&self, registry: &RegistryName) -> (Arc<RegistryClient>, RegistryEndpoint) {
        let endpoint = RegistryEndpoint::parse(registry);
        let token = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(registry)
            .cloned()
            .flatten();
        let key = (endpoint.host.clone(), token);

        if let Some(client) = self
            .clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
        {
            return (client.clone(), endpoint);
        }

        let mut clients = self
            .clients
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let client = clients
            .entry(key.clone())
            .or_insert_with(|| {
                tracing::debug!(host = %key.0, "opening registry client");
                Arc::new(RegistryClient::new(endpoint.base_url(), key.1.clone(), self.timeout))
            })
            .clone();
        (client, endpoint)
    }

    pub fn len(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registries_on_one_host_share_a_client() {
        let pool = RegistryPool::new(Duration::from_secs(5));
        let (a, _) = pool.client(&RegistryName::from("gcr.io/staging"));
        let (b, ep) = pool.client(&RegistryName::from("gcr.io/prod"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(ep.namespace, "prod");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_tokens_get_distinct_clients() {
        let pool = RegistryPool::new(Duration::from_secs(5));
        pool.set_token(&RegistryName::from("gcr.io/prod"), Some("secret".to_string()));
        let (a, _) = pool.client(&RegistryName::from("gcr.io/staging"));
        let (b, _) = pool.client(&RegistryName::from("gcr.io/prod"));
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 2);
    }
}
