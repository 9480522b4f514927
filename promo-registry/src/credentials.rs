//! Registry credentials and their activation.
//!
//! Tokens come from an optional YAML file:
//!
//! ```yaml
//! registries:
//!   gcr.io/k8s-artifacts-prod: <bearer token>
//! service-accounts:
//!   promoter@project.iam.gserviceaccount.com: <bearer token>
//! ```
//!
//! and from `PROMO_REGISTRY_TOKEN`, which applies to any registry without a
//! more specific entry. Registry keys match by longest path prefix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;

use promo_core::{AuthError, CredentialActivator, RegistryContext, RunConfig};

use crate::error::RegistryError;
use crate::pool::RegistryPool;

pub const TOKEN_ENV: &str = "PROMO_REGISTRY_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CredentialStore {
    registries: BTreeMap<String, String>,
    service_accounts: BTreeMap<String, String>,
    #[serde(skip)]
    fallback: Option<String>,
}

impl CredentialStore {
    /// `~/.config/promoter/credentials.yaml` (platform config dir).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("promoter").join("credentials.yaml"))
    }

    pub fn load_at(path: &Path) -> Result<Self, RegistryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| RegistryError::Credentials {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        serde_yaml::from_str(&contents).map_err(|e| RegistryError::Credentials {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Explicit path, else the default path when it exists, else empty;
    /// the environment token is layered on top in every case.
    pub fn discover(path: Option<&Path>) -> Result<Self, RegistryError> {
        let mut store = match path {
            Some(path) => Self::load_at(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::load_at(&path)?,
                None => Self::default(),
            },
        };
        store.fallback = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        Ok(store)
    }

    pub fn with_registry(mut self, registry: &str, token: &str) -> Self {
        self.registries.insert(registry.to_string(), token.to_string());
        self
    }

    pub fn with_service_account(mut self, account: &str, token: &str) -> Self {
        self.service_accounts
            .insert(account.to_string(), token.to_string());
        self
    }

    pub fn with_fallback(mut self, token: &str) -> Self {
        self.fallback = Some(token.to_string());
        self
    }

    pub fn service_account_token(&self, account: &str) -> Option<&str> {
        self.service_accounts.get(account).map(String::as_str)
    }

    /// Longest registry key that is a path prefix of `registry`, then the
    /// environment fallback.
    pub fn registry_token(&self, registry: &str) -> Option<&str> {
        let registry = registry.trim_end_matches('/');
        self.registries
            .iter()
            .filter(|(key, _)| {
                let key = key.trim_end_matches('/');
                registry == key
                    || registry
                        .strip_prefix(key)
                        .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(key, _)| key.len())
            .map(|(_, token)| token.as_str())
            .or(self.fallback.as_deref())
    }
}

/// Resolves a token for every registry of the run and installs it in the
/// shared [`RegistryPool`].
///
/// With `use_service_account`, a registry naming a service account must have
/// a token for that account; a missing one fails activation. Without it,
/// registries fall back to anonymous access when no token matches.
pub struct TokenActivator {
    store: CredentialStore,
    pool: Arc<RegistryPool>,
}

impl TokenActivator {
    pub fn new(store: CredentialStore, pool: Arc<RegistryPool>) -> Self {
        Self { store, pool }
    }
}

impl CredentialActivator for TokenActivator {
    fn activate(
        &self,
        registries: &[RegistryContext],
        config: &RunConfig,
    ) -> Result<(), AuthError> {
        for registry in registries {
            let token = match (&registry.service_account, config.use_service_account) {
                (Some(account), true) => Some(
                    self.store
                        .service_account_token(account)
                        .ok_or_else(|| AuthError {
                            registry: registry.name.clone(),
                            reason: format!("no credentials for service account {account}"),
                        })?,
                ),
                _ => self.store.registry_token(registry.name.as_str()),
            };
            tracing::info!(
                registry = %registry.name,
                authenticated = token.is_some(),
                "activated registry credentials"
            );
            self.pool.set_token(&registry.name, token.map(str::to_string));
        }
        Ok(())
    }
}
