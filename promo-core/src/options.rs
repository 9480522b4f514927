//! Run configuration.
//!
//! A [`RunConfig`] is built once per run (defaults, then an optional YAML
//! file via [`RunConfig::load_at`], then CLI overrides) and passed down by
//! reference. Nothing reads configuration from global state.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, LoadError, ValidationError};
use crate::snapshot::OutputFormat;
use crate::types::Severity;

pub const DEFAULT_THREADS: usize = 10;
pub const MAX_THREADS: usize = 256;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RunConfig {
    /// Upper bound on concurrently executing edges (and scans).
    pub threads: usize,
    /// Live runs only happen when confirmed; otherwise the run is a dry-run.
    pub confirm: bool,
    /// Stop after edge computation.
    pub parse_only: bool,
    /// Use per-registry service-account credentials and direct
    /// registry-to-registry copies.
    pub use_service_account: bool,
    /// Attempts per edge, including the first one.
    pub max_attempts: u32,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    /// Timeout applied to each individual transfer attempt.
    pub attempt_timeout_secs: u64,
    /// Optional deadline for the whole execution phase.
    pub run_deadline_secs: Option<u64>,
    /// Scan mode fails on any vulnerability at or above this severity.
    pub severity_threshold: Option<Severity>,
    /// Only count vulnerabilities that have a fix available.
    pub fixable_only: bool,
    pub output_format: OutputFormat,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            confirm: false,
            parse_only: false,
            use_service_account: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_initial_ms: 500,
            backoff_max_ms: 8_000,
            attempt_timeout_secs: 300,
            run_deadline_secs: None,
            severity_threshold: None,
            fixable_only: false,
            output_format: OutputFormat::Yaml,
        }
    }
}

impl RunConfig {
    /// Load a config file; missing keys take their defaults.
    ///
    /// Returns `LoadError::NotFound` if absent and `LoadError::Parse` (with
    /// path + line context) if malformed.
    pub fn load_at(path: &Path) -> Result<Self, LoadError> {
        if !path.exists() {
            return Err(LoadError::NotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        serde_yaml::from_str(&contents).map_err(|e| LoadError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn dry_run(&self) -> bool {
        !self.confirm
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(ValidationError::Option {
                option: "threads",
                reason: format!("must be between 1 and {MAX_THREADS}, got {}", self.threads),
            });
        }
        if self.max_attempts == 0 {
            return Err(ValidationError::Option {
                option: "max-attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(ValidationError::Option {
                option: "backoff-initial-ms",
                reason: format!(
                    "{} exceeds backoff-max-ms {}",
                    self.backoff_initial_ms, self.backoff_max_ms
                ),
            });
        }
        if self.attempt_timeout_secs == 0 {
            return Err(ValidationError::Option {
                option: "attempt-timeout-secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.run_deadline_secs == Some(0) {
            return Err(ValidationError::Option {
                option: "run-deadline-secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        Ok(())
    }
}
