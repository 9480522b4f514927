//! Promoter, a container image promotion CLI.
//!
//! # Usage
//!
//! ```text
//! promoter promote --manifest <file|dir> [--confirm] [--parse-only] [--threads N] [--json]
//! promoter security-scan --manifest <file|dir> [--severity-threshold high] [--fixable-only]
//! promoter snapshot --registry <name> [--manifest <file|dir>] [--tag <tag>] [--minimal]
//!                   [--format yaml|csv] [--output <file>]
//! promoter check-manifest-lists --registry <name> [--snapshot <file>]
//! ```
//!
//! Global flags: `--config <file>` (run configuration YAML),
//! `--credentials <file>`, `--log-json`.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckManifestListsArgs, promote::PromoteArgs, scan::SecurityScanArgs,
    snapshot::SnapshotArgs, GlobalArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "promoter",
    version,
    about = "Promote container images between registries from a declarative manifest",
    long_about = None,
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Copy and retag images so destinations match the manifests.
    Promote(PromoteArgs),

    /// Scan the source images a promotion would copy for vulnerabilities.
    SecurityScan(SecurityScanArgs),

    /// Print the current contents of a registry as YAML or CSV.
    Snapshot(SnapshotArgs),

    /// Check that every manifest list in a registry has all its children.
    CheckManifestLists(CheckManifestListsArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    promo_runtime::init_tracing(cli.global.log_json);
    match cli.command {
        Commands::Promote(args) => args.run(&cli.global),
        Commands::SecurityScan(args) => args.run(&cli.global),
        Commands::Snapshot(args) => args.run(&cli.global),
        Commands::CheckManifestLists(args) => args.run(&cli.global),
    }
}
