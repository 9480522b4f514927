//! `promoter check-manifest-lists`: every list's children must be present.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use promo_core::RegistryContext;
use promo_runtime::{ManifestListRequest, Promoter};

use super::{runtime, GlobalArgs};

/// Arguments for `promoter check-manifest-lists`.
#[derive(Args, Debug)]
pub struct CheckManifestListsArgs {
    /// Registry path to check.
    #[arg(long)]
    pub registry: String,

    /// Snapshot (YAML or CSV) naming the images and digests to check.
    /// The whole registry is checked when omitted.
    #[arg(long)]
    pub snapshot: Option<PathBuf>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl CheckManifestListsArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.run_config(|_| {})?;
        let backend = global.backend(&config, None)?;
        let promoter = Promoter::new(config, backend);

        let check = runtime()?.block_on(promoter.check_manifest_lists(ManifestListRequest {
            registry: RegistryContext::source(self.registry.as_str()),
            snapshot: self.snapshot.clone(),
        }))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&check.findings)
                    .context("failed to serialize findings JSON")?
            );
        } else if check.findings.is_empty() {
            println!("{} manifest lists in {} are complete", "✓".green().bold(), self.registry);
        } else {
            for finding in &check.findings {
                println!("  {} {finding}", "✗".red());
            }
        }
        check.into_result()?;
        Ok(())
    }
}
