//! `promoter promote`: reconcile destination registries with the manifests.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use promo_core::PromotionEdge;
use promo_runtime::{EdgeOutcome, ManifestInput, Promoter, Promotion, RunReport};
use promo_sync::EdgeFinding;

use super::{cancel_on_interrupt, runtime, short_digest, GlobalArgs, RunOverrides};

/// Arguments for `promoter promote`.
#[derive(Args, Debug)]
pub struct PromoteArgs {
    /// Manifest file, or a directory with `manifests/` and `images/`.
    #[arg(long)]
    pub manifest: PathBuf,

    /// Perform the transfers. Without this the run is a dry-run.
    #[arg(long)]
    pub confirm: bool,

    /// Compute and print the edges, then stop.
    #[arg(long)]
    pub parse_only: bool,

    #[command(flatten)]
    pub overrides: RunOverrides,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl PromoteArgs {
    pub fn run(self, global: &GlobalArgs) -> Result<()> {
        let config = global.run_config(|config| {
            self.overrides.apply(config);
            config.confirm |= self.confirm;
            config.parse_only |= self.parse_only;
        })?;
        let backend = global.backend(&config, None)?;
        let promoter = Promoter::new(config, backend);

        let input = ManifestInput::Path(self.manifest.clone());
        let promotion = runtime()?.block_on(async {
            cancel_on_interrupt(promoter.cancellation().clone());
            promoter.promote(input).await
        })?;

        if self.json {
            print_json(&promotion)?;
        } else {
            print_promotion(&promotion);
        }
        promotion.into_result()?;
        Ok(())
    }
}

#[derive(Serialize)]
struct PromotionJson<'a> {
    edges: Vec<&'a PromotionEdge>,
    findings: Vec<&'a EdgeFinding>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report: Option<&'a RunReport>,
}

#[derive(Tabled)]
struct EdgeRow {
    #[tabled(rename = "op")]
    op: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "destination")]
    destination: String,
    #[tabled(rename = "result")]
    result: String,
}

impl EdgeRow {
    fn new(edge: &PromotionEdge, result: &str) -> Self {
        let digest = short_digest(edge.digest.as_str());
        let destination = edge.dst_registry.name.join(&edge.dst_image);
        Self {
            op: edge.op.to_string(),
            source: format!("{}@{digest}", edge.src_registry.join(&edge.src_image)),
            destination: match &edge.tag {
                Some(tag) => format!("{destination}:{tag}"),
                None => format!("{destination}@{digest}"),
            },
            result: result.to_string(),
        }
    }
}

fn print_json(promotion: &Promotion) -> Result<()> {
    let payload = PromotionJson {
        edges: promotion.plan.edges.iter().collect(),
        findings: promotion.plan.findings.iter().collect(),
        report: promotion.report.as_ref(),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to serialize promotion JSON")?
    );
    Ok(())
}

fn print_promotion(promotion: &Promotion) {
    for finding in &promotion.plan.findings {
        println!("{} {finding}", "!".yellow().bold());
    }
    if promotion.plan.is_empty() {
        println!("✓ destinations already match the manifests");
        return;
    }

    let rows: Vec<EdgeRow> = match &promotion.report {
        None => promotion
            .plan
            .edges
            .iter()
            .map(|edge| EdgeRow::new(edge, "planned"))
            .collect(),
        Some(report) => report
            .results
            .iter()
            .map(|r| EdgeRow::new(&r.edge, r.outcome.label()))
            .collect(),
    };
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    let Some(report) = &promotion.report else {
        println!("[parse-only] {} edges computed", promotion.plan.len());
        return;
    };
    if report.dry_run {
        println!(
            "[dry-run] {} edges would be applied; rerun with --confirm to promote",
            report.results.len()
        );
        return;
    }

    for result in &report.results {
        match &result.outcome {
            EdgeOutcome::Failed { attempts, error } => {
                println!("  {} {} after {attempts} attempt(s): {error}", "✗".red(), result.edge);
            }
            EdgeOutcome::Abandoned {
                reason, completed, ..
            } => {
                let effect = if *completed {
                    "completed anyway"
                } else {
                    "did not complete"
                };
                println!("  {} {}: {reason}; {effect}", "✗".red(), result.edge);
            }
            _ => {}
        }
    }
    let mut line = format!(
        "{} succeeded, {} failed, {} skipped, {} cancelled",
        report.succeeded(),
        report.failed(),
        report.skipped(),
        report.cancelled_edges()
    );
    if report.abandoned() > 0 {
        line.push_str(&format!(", {} abandoned", report.abandoned()));
    }
    if report.is_success() {
        println!("{} {line}", "✓".green().bold());
    } else {
        println!("{} {line}", "✗".red().bold());
    }
}
