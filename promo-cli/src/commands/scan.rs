//! `promoter security-scan`: vulnerability check of the images a promotion
//! would copy.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use promo_core::Severity;
use promo_runtime::{ManifestInput, Promoter, SecurityScan};

use super::{cancel_on_interrupt, runtime, short_digest, GlobalArgs, RunOverrides};

/// Arguments for `promoter security-scan`.
#[derive(Args, Debug)]
pub struct SecurityScanArgs {
    /// Manifest file, or a directory with `manifests/` and `images/`.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Fail on vulnerabilities at or above this severity
    /// (minimal, low, medium, high, critical). Report only when omitted.
    #[arg(long)]
    pub severity_threshold: Option<Severity>,

    /// Only count vulnerabilities with a fix available.
    #[arg(long)]
    pub fixable_only: bool,

    /// Base URL of the vulnerability scanning service.
    #[arg(long)]
    pub scanner_url: Option<String>,

    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl SecurityScanArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.run_config(|config| {
            self.overrides.apply(config);
            if self.severity_threshold.is_some() {
                config.severity_threshold = self.severity_threshold;
            }
            config.fixable_only |= self.fixable_only;
        })?;
        let backend = global.backend(&config, self.scanner_url.as_deref())?;
        let promoter = Promoter::new(config, backend);

        let input = ManifestInput::Path(self.manifest.clone());
        let scan = runtime()?.block_on(async {
            cancel_on_interrupt(promoter.cancellation().clone());
            promoter.security_scan(input).await
        })?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&scan.summary)
                    .context("failed to serialize scan JSON")?
            );
        } else {
            print_scan(&scan);
        }
        scan.into_result()?;
        Ok(())
    }
}

#[derive(Tabled)]
struct ScanRow {
    #[tabled(rename = "image")]
    image: String,
    #[tabled(rename = "vulnerabilities")]
    vulnerabilities: usize,
    #[tabled(rename = "violations")]
    violations: usize,
    #[tabled(rename = "status")]
    status: String,
}

fn print_scan(scan: &SecurityScan) {
    let summary = &scan.summary;
    if summary.results.is_empty() {
        println!("✓ nothing to scan: destinations already match the manifests");
        return;
    }

    let rows: Vec<ScanRow> = summary
        .results
        .iter()
        .map(|r| ScanRow {
            image: format!(
                "{}@{}",
                r.registry.join(&r.image),
                short_digest(r.digest.as_str())
            ),
            vulnerabilities: r.vulnerabilities.len(),
            violations: r.violations.len(),
            status: match (&r.error, r.violations.is_empty()) {
                (Some(_), _) => "error".to_string(),
                (None, true) => "ok".to_string(),
                (None, false) => "blocked".to_string(),
            },
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    for result in &summary.results {
        if let Some(error) = &result.error {
            println!("  {} {}: {error}", "✗".red(), result.reference());
        }
        for vulnerability in &result.violations {
            println!(
                "  {} {}: {} ({}{})",
                "✗".red(),
                result.reference(),
                vulnerability.id,
                vulnerability.severity,
                if vulnerability.fix_available { ", fix available" } else { "" }
            );
        }
    }

    let line = format!(
        "{} images scanned, {} violations, {} errors",
        summary.results.len(),
        summary.violations(),
        summary.errors()
    );
    if summary.violations() == 0 && summary.errors() == 0 && !summary.cancelled {
        println!("{} {line}", "✓".green().bold());
    } else {
        println!("{} {line}", "✗".red().bold());
    }
}
