//! Subcommands and the plumbing they share: configuration layering, backend
//! selection and the async runtime.

pub mod check;
pub mod promote;
pub mod scan;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use promo_core::{FixtureRegistry, RunConfig, VulnerabilityScanner};
use promo_registry::{
    CredentialStore, HttpScanner, NetworkInventory, NetworkTransfers, RegistryPool,
    TokenActivator, TransferMode, UnconfiguredScanner,
};
use promo_runtime::{Backend, Cancellation};

/// Bearer token sent to the vulnerability scanning service.
const SCANNER_TOKEN_ENV: &str = "PROMO_SCANNER_TOKEN";

/// Flags accepted by every subcommand.
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Run configuration file (YAML). Command-line flags override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Registry credentials file (YAML). Defaults to the platform config
    /// directory; `PROMO_REGISTRY_TOKEN` applies when no entry matches.
    #[arg(long, global = true)]
    pub credentials: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Serve every registry from an in-memory fixture file.
    #[arg(long, global = true, hide = true)]
    pub fixture: Option<PathBuf>,
}

impl GlobalArgs {
    /// Defaults, then `--config`, then `overrides`, in that order.
    pub fn run_config(&self, overrides: impl FnOnce(&mut RunConfig)) -> Result<RunConfig> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load_at(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => RunConfig::default(),
        };
        overrides(&mut config);
        Ok(config)
    }

    pub fn backend(&self, config: &RunConfig, scanner_url: Option<&str>) -> Result<Backend> {
        if let Some(path) = &self.fixture {
            let fixture = FixtureRegistry::load_at(path)
                .with_context(|| format!("failed to load fixture {}", path.display()))?;
            tracing::debug!(fixture = %path.display(), "using in-memory registry backend");
            return Ok(Backend::fixture(fixture));
        }

        let store = CredentialStore::discover(self.credentials.as_deref())
            .context("failed to load registry credentials")?;
        let pool = Arc::new(RegistryPool::new(config.attempt_timeout()));
        let mode = TransferMode::for_credentials(config.use_service_account);
        tracing::debug!(?mode, "using network registry backend");
        let scanner: Arc<dyn VulnerabilityScanner> = match scanner_url {
            Some(url) => Arc::new(HttpScanner::new(
                url,
                std::env::var(SCANNER_TOKEN_ENV).ok(),
                config.attempt_timeout(),
            )),
            None => Arc::new(UnconfiguredScanner),
        };
        Ok(Backend {
            inventory: Arc::new(NetworkInventory::new(Arc::clone(&pool))),
            transfers: Arc::new(NetworkTransfers::new(Arc::clone(&pool), mode)),
            scanner,
            credentials: Arc::new(TokenActivator::new(store, pool)),
        })
    }
}

/// Execution flags shared by `promote` and `security-scan`.
#[derive(Args, Debug, Default)]
pub struct RunOverrides {
    /// Maximum concurrent transfers or scans.
    #[arg(long)]
    pub threads: Option<usize>,

    /// Authenticate with the service accounts named in the manifests.
    #[arg(long)]
    pub use_service_account: bool,

    /// Attempts per edge, including the first.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Cancel whatever is still running after this many seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,
}

impl RunOverrides {
    pub fn apply(&self, config: &mut RunConfig) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if self.use_service_account {
            config.use_service_account = true;
        }
        if let Some(max_attempts) = self.max_attempts {
            config.max_attempts = max_attempts;
        }
        if let Some(deadline) = self.deadline_secs {
            config.run_deadline_secs = Some(deadline);
        }
    }
}

pub fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
}

/// Cancel `cancel` on Ctrl-C. Must be called from inside the runtime.
pub fn cancel_on_interrupt(cancel: Cancellation) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });
}

/// Digest cut to 12 hex characters for table cells.
pub fn short_digest(digest: &str) -> String {
    match digest.split_once(':') {
        Some((algorithm, hex)) => match hex.get(..12) {
            Some(prefix) if hex.len() > 12 => format!("{algorithm}:{prefix}"),
            _ => digest.to_string(),
        },
        None => digest.to_string(),
    }
}
