//! `promoter snapshot`: dump a registry's contents.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use promo_core::{OutputFormat, RegistryContext, SnapshotFilter, Tag};
use promo_runtime::{ManifestInput, Promoter, SnapshotRequest};

use super::{runtime, GlobalArgs};

/// Arguments for `promoter snapshot`.
#[derive(Args, Debug)]
pub struct SnapshotArgs {
    /// Registry path to snapshot, e.g. `gcr.io/k8s-artifacts-prod`.
    #[arg(long)]
    pub registry: String,

    /// Limit the snapshot to the images these manifests name.
    #[arg(long)]
    pub manifest: Option<PathBuf>,

    /// Keep only digests carrying this tag.
    #[arg(long)]
    pub tag: Option<Tag>,

    /// Leave out manifest-list children.
    #[arg(long)]
    pub minimal: bool,

    /// Output format (yaml or csv). Defaults to the config file's, or to
    /// the extension of `--output`.
    #[arg(long)]
    pub format: Option<OutputFormat>,

    /// Write to this file instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

impl SnapshotArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.run_config(|_| {})?;
        let format = self
            .format
            .or_else(|| self.output.as_deref().map(OutputFormat::from_path))
            .unwrap_or(config.output_format);
        let backend = global.backend(&config, None)?;
        let promoter = Promoter::new(config, backend);

        let request = SnapshotRequest {
            registry: RegistryContext::source(self.registry.as_str()),
            manifests: self.manifest.clone().map(ManifestInput::Path),
            filter: SnapshotFilter {
                tag: self.tag.clone(),
                minimal: self.minimal,
            },
            format,
        };
        let snapshot = runtime()?.block_on(promoter.snapshot(request))?;

        match &self.output {
            Some(path) => {
                std::fs::write(path, &snapshot.rendered)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                eprintln!(
                    "✓ {} images from {} written to {}",
                    snapshot.images.len(),
                    self.registry,
                    path.display()
                );
            }
            None => print!("{}", snapshot.rendered),
        }
        Ok(())
    }
}
