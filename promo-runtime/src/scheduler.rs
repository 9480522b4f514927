//! Execution scheduler: runs an [`EdgePlan`] with bounded parallelism.
//!
//! ## Protocol
//!
//! 1. One task per edge. Each task first waits on the completion channel of
//!    every edge it depends on (no permit held while waiting).
//! 2. Any dependency that did not succeed → `Skipped`, never attempted.
//! 3. Otherwise take a semaphore permit per attempt and run the transfer on
//!    the blocking pool. The permit travels with the transfer and is only
//!    released when the transfer returns.
//! 4. Transient errors are retried with exponential backoff up to
//!    `max_attempts`; permanent errors fail at once. A failure never cancels
//!    siblings.
//! 5. An attempt that outlives its timeout, or is still running when the run
//!    is cancelled, cannot be interrupted. The edge is `Abandoned` and is not
//!    retried; its dependents see a failure. Its transfer is still awaited
//!    before the report is built, and the report records whether it
//!    completed.
//! 6. Publish success/failure on the edge's own channel.
//!
//! Cancellation (explicit or via the run deadline) is observed while waiting
//! on dependencies, on the semaphore, during an attempt and during backoff.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use promo_core::{PromotionEdge, RunConfig, TransferError, TransferFactory};
use promo_sync::EdgePlan;

use crate::cancel::Cancellation;
use crate::error::AggregateRunError;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The execution-relevant subset of [`RunConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSettings {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    pub run_deadline: Option<Duration>,
    pub dry_run: bool,
}

impl ExecutionSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            concurrency: config.threads.max(1),
            max_attempts: config.max_attempts.max(1),
            backoff_initial: config.backoff_initial(),
            backoff_max: config.backoff_max(),
            attempt_timeout: config.attempt_timeout(),
            run_deadline: config.run_deadline(),
            dry_run: config.dry_run(),
        }
    }

    /// Delay before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_initial
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum EdgeOutcome {
    Succeeded {
        attempts: u32,
    },
    Failed {
        attempts: u32,
        error: String,
    },
    /// The last attempt timed out or was cancelled mid-flight. `completed`
    /// records whether the transfer took effect after it was given up on.
    Abandoned {
        attempts: u32,
        reason: String,
        completed: bool,
    },
    /// A dependency did not succeed; the edge was never attempted.
    Skipped {
        failed_dependencies: Vec<String>,
    },
    Cancelled,
    DryRun,
}

impl EdgeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EdgeOutcome::Succeeded { .. } | EdgeOutcome::DryRun)
    }

    pub fn label(&self) -> &'static str {
        match self {
            EdgeOutcome::Succeeded { .. } => "succeeded",
            EdgeOutcome::Failed { .. } => "failed",
            EdgeOutcome::Abandoned { .. } => "abandoned",
            EdgeOutcome::Skipped { .. } => "skipped",
            EdgeOutcome::Cancelled => "cancelled",
            EdgeOutcome::DryRun => "dry-run",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EdgeResult {
    pub edge: PromotionEdge,
    pub outcome: EdgeOutcome,
}

/// Per-edge results of one execution, in edge order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub results: Vec<EdgeResult>,
    /// Problems found before execution that still fail the run.
    pub findings: Vec<String>,
    pub dry_run: bool,
    pub cancelled: bool,
    pub duration_ms: u128,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&EdgeOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, EdgeOutcome::Succeeded { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, EdgeOutcome::Failed { .. }))
    }

    pub fn abandoned(&self) -> usize {
        self.count(|o| matches!(o, EdgeOutcome::Abandoned { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, EdgeOutcome::Skipped { .. }))
    }

    pub fn cancelled_edges(&self) -> usize {
        self.count(|o| matches!(o, EdgeOutcome::Cancelled))
    }

    pub fn outcome(&self, edge: &PromotionEdge) -> Option<&EdgeOutcome> {
        self.results
            .iter()
            .find(|r| &r.edge == edge)
            .map(|r| &r.outcome)
    }

    pub fn edges(&self) -> impl Iterator<Item = &PromotionEdge> {
        self.results.iter().map(|r| &r.edge)
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled
            && self.findings.is_empty()
            && self.results.iter().all(|r| r.outcome.is_success())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// `Ok` only when every edge succeeded (or was a dry-run) and nothing
    /// else was reported. Abandoned edges count as failed.
    pub fn into_result(self) -> Result<RunReport, AggregateRunError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(AggregateRunError {
            failed: self.failed() + self.abandoned(),
            skipped: self.skipped(),
            cancelled: self.cancelled_edges(),
            findings: self.findings,
        })
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

type Completion = watch::Receiver<Option<bool>>;
type Transfer = JoinHandle<Result<(), TransferError>>;

/// Execute `plan`. Never fails as a whole; every edge gets an outcome.
///
/// Returns only once every transfer it started has finished, abandoned ones
/// included, so the destinations no longer change under the report.
pub async fn execute(
    plan: &EdgePlan,
    factory: Arc<dyn TransferFactory>,
    settings: &ExecutionSettings,
    cancel: &Cancellation,
) -> RunReport {
    let started = Instant::now();
    let findings = plan.findings.iter().map(ToString::to_string).collect();

    if settings.dry_run {
        for edge in &plan.edges {
            tracing::info!(edge = %edge, "dry-run: would promote");
        }
        return RunReport {
            results: plan
                .edges
                .iter()
                .map(|edge| EdgeResult {
                    edge: edge.clone(),
                    outcome: EdgeOutcome::DryRun,
                })
                .collect(),
            findings,
            dry_run: true,
            cancelled: false,
            duration_ms: started.elapsed().as_millis(),
        };
    }

    tracing::info!(
        edges = plan.len(),
        concurrency = settings.concurrency,
        "executing promotion edges"
    );

    let deadline = settings.run_deadline.map(|d| cancel.cancel_after(d));
    let semaphore = Arc::new(Semaphore::new(settings.concurrency));

    let mut senders: BTreeMap<&PromotionEdge, watch::Sender<Option<bool>>> = BTreeMap::new();
    let mut receivers: BTreeMap<&PromotionEdge, Completion> = BTreeMap::new();
    for edge in &plan.edges {
        let (tx, rx) = watch::channel(None);
        senders.insert(edge, tx);
        receivers.insert(edge, rx);
    }

    let mut handles = Vec::with_capacity(plan.len());
    for edge in &plan.edges {
        let deps: Vec<(PromotionEdge, Completion)> = plan
            .dependencies_of(edge)
            .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
            .collect();
        let task = EdgeTask {
            edge: edge.clone(),
            deps,
            done: senders.remove(edge),
            factory: Arc::clone(&factory),
            semaphore: Arc::clone(&semaphore),
            settings: settings.clone(),
            cancel: cancel.clone(),
        };
        handles.push((edge.clone(), tokio::spawn(task.run())));
    }
    drop(receivers);

    let mut results = Vec::with_capacity(handles.len());
    for (edge, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(edge = %edge, error = %err, "edge task panicked");
                EdgeOutcome::Failed {
                    attempts: 0,
                    error: format!("edge task join failure: {err}"),
                }
            }
        };
        results.push(EdgeResult { edge, outcome });
    }

    if let Some(timer) = deadline {
        timer.abort();
    }

    let report = RunReport {
        results,
        findings,
        dry_run: false,
        cancelled: cancel.is_cancelled(),
        duration_ms: started.elapsed().as_millis(),
    };
    tracing::info!(
        succeeded = report.succeeded(),
        failed = report.failed(),
        abandoned = report.abandoned(),
        skipped = report.skipped(),
        cancelled = report.cancelled_edges(),
        duration_ms = report.duration_ms as u64,
        "promotion finished"
    );
    report
}

/// How one edge ended before any abandoned transfer settled.
enum Settled {
    Done(EdgeOutcome),
    Abandoned {
        attempts: u32,
        reason: String,
        transfer: Transfer,
    },
}

/// How one attempt ended.
enum Attempt {
    Finished(Result<(), TransferError>),
    /// Stopped waiting; the transfer still runs and still holds its permit.
    Abandoned { reason: String, transfer: Transfer },
    /// Cancelled before a permit was granted, so nothing was started.
    NotStarted,
}

struct EdgeTask {
    edge: PromotionEdge,
    deps: Vec<(PromotionEdge, Completion)>,
    done: Option<watch::Sender<Option<bool>>>,
    factory: Arc<dyn TransferFactory>,
    semaphore: Arc<Semaphore>,
    settings: ExecutionSettings,
    cancel: Cancellation,
}

impl EdgeTask {
    async fn run(mut self) -> EdgeOutcome {
        let settled = self.drive().await;

        // Dependents only ever see a confirmed success.
        if let Some(done) = self.done.take() {
            let ok = matches!(&settled, Settled::Done(EdgeOutcome::Succeeded { .. }));
            done.send_replace(Some(ok));
        }

        match settled {
            Settled::Done(outcome) => outcome,
            Settled::Abandoned {
                attempts,
                reason,
                transfer,
            } => {
                let completed = matches!(transfer.await, Ok(Ok(())));
                tracing::warn!(
                    edge = %self.edge,
                    attempts,
                    completed,
                    "abandoned transfer settled"
                );
                EdgeOutcome::Abandoned {
                    attempts,
                    reason,
                    completed,
                }
            }
        }
    }

    async fn drive(&mut self) -> Settled {
        let mut failed = BTreeSet::new();
        for (dep, rx) in &mut self.deps {
            let succeeded = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Settled::Done(EdgeOutcome::Cancelled),
                ok = settled(rx) => ok,
            };
            if !succeeded {
                failed.insert(dep.to_string());
            }
        }
        if !failed.is_empty() {
            tracing::warn!(
                edge = %self.edge,
                failed_dependencies = failed.len(),
                "skipping edge, dependency did not succeed"
            );
            return Settled::Done(EdgeOutcome::Skipped {
                failed_dependencies: failed.into_iter().collect(),
            });
        }

        let mut attempts = 0;
        loop {
            let err = match self.attempt().await {
                Attempt::Finished(Ok(())) => {
                    attempts += 1;
                    tracing::info!(edge = %self.edge, attempts, "edge promoted");
                    return Settled::Done(EdgeOutcome::Succeeded { attempts });
                }
                Attempt::Finished(Err(err)) => {
                    attempts += 1;
                    err
                }
                Attempt::Abandoned { reason, transfer } => {
                    attempts += 1;
                    tracing::error!(
                        edge = %self.edge,
                        attempts,
                        reason = %reason,
                        "abandoning in-flight transfer"
                    );
                    return Settled::Abandoned {
                        attempts,
                        reason,
                        transfer,
                    };
                }
                Attempt::NotStarted => return Settled::Done(EdgeOutcome::Cancelled),
            };

            if !err.is_transient() || attempts >= self.settings.max_attempts {
                tracing::error!(edge = %self.edge, attempts, error = %err, "edge failed");
                return Settled::Done(EdgeOutcome::Failed {
                    attempts,
                    error: err.to_string(),
                });
            }

            let delay = self.settings.backoff(attempts);
            tracing::warn!(
                edge = %self.edge,
                attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %err,
                "transient failure, retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Settled::Done(EdgeOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One attempt on the blocking pool. The permit moves into the blocking
    /// closure, so it is released when the transfer ends rather than when
    /// this task stops waiting for it.
    async fn attempt(&self) -> Attempt {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Attempt::NotStarted,
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Attempt::NotStarted,
            },
        };

        let op = self.factory.make(&self.edge);
        let mut transfer: Transfer = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            op.run()
        });

        let timeout = self.settings.attempt_timeout;
        let waited = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            joined = tokio::time::timeout(timeout, &mut transfer) => Some(joined),
        };
        match waited {
            Some(Ok(Ok(result))) => Attempt::Finished(result),
            Some(Ok(Err(join))) => Attempt::Finished(Err(TransferError::Permanent(format!(
                "transfer task failed: {join}"
            )))),
            Some(Err(_)) => Attempt::Abandoned {
                reason: format!("attempt timed out after {timeout:?}"),
                transfer,
            },
            None => Attempt::Abandoned {
                reason: "run cancelled while the transfer was in flight".to_string(),
                transfer,
            },
        }
    }
}

/// Wait until a dependency publishes its result. A dropped sender counts as
/// failure.
async fn settled(rx: &mut Completion) -> bool {
    loop {
        let state = *rx.borrow_and_update();
        if let Some(ok) = state {
            return ok;
        }
        if rx.changed().await.is_err() {
            return false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ExecutionSettings {
        ExecutionSettings::from_config(&RunConfig::default())
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let s = settings();
        assert_eq!(s.backoff(1), Duration::from_millis(500));
        assert_eq!(s.backoff(2), Duration::from_millis(1_000));
        assert_eq!(s.backoff(4), Duration::from_millis(4_000));
        assert_eq!(s.backoff(5), Duration::from_millis(8_000));
        assert_eq!(s.backoff(30), Duration::from_millis(8_000));
    }

    #[test]
    fn default_config_is_dry_run() {
        assert!(settings().dry_run);
        let live = ExecutionSettings::from_config(&RunConfig {
            confirm: true,
            ..Default::default()
        });
        assert!(!live.dry_run);
    }

    #[test]
    fn empty_report_is_success() {
        assert!(RunReport::default().into_result().is_ok());
    }

    #[test]
    fn findings_fail_the_report() {
        let report = RunReport {
            findings: vec!["gcr.io/prod/foo: destination registry unreachable".to_string()],
            ..Default::default()
        };
        let err = report.into_result().unwrap_err();
        assert_eq!(err.findings.len(), 1);
        assert_eq!(err.to_string(), "0 failed, 0 skipped, 0 cancelled, 1 findings");
    }
}
