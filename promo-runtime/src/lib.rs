//! Async execution engine and mode drivers for image promotion.

mod cancel;
mod error;
pub mod promoter;
pub mod scan;
pub mod scheduler;

pub use cancel::Cancellation;
pub use error::{AggregateRunError, ManifestListError, RunError, SnapshotError};
pub use promoter::{
    Backend, ManifestInput, ManifestListCheck, ManifestListRequest, Promoter, Promotion,
    SecurityScan, Snapshot, SnapshotRequest,
};
pub use scan::{scan_sources, ScanPolicy, ScanResult, ScanSummary};
pub use scheduler::{execute, EdgeOutcome, EdgeResult, ExecutionSettings, RunReport};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter; `json` switches to one JSON object per line.
pub fn init_tracing(json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
