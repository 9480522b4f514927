//! Vulnerability scan driver.
//!
//! Scans the *source* of every edge instead of copying it. Each distinct
//! `(registry, image, digest)` is scanned once, with the same concurrency
//! bound as promotion. Nothing is written, so no dependency gating applies.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;

use promo_core::{Digest, ImageName, RegistryName, Severity, Vulnerability, VulnerabilityScanner};
use promo_sync::EdgePlan;

use crate::cancel::Cancellation;
use crate::error::AggregateRunError;

/// Which findings make the scan fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanPolicy {
    /// Fail on vulnerabilities at or above this severity; `None` reports only.
    pub threshold: Option<Severity>,
    pub fixable_only: bool,
}

impl ScanPolicy {
    fn counts(&self, vulnerability: &Vulnerability) -> bool {
        if self.fixable_only && !vulnerability.fix_available {
            return false;
        }
        self.threshold
            .is_some_and(|threshold| vulnerability.severity >= threshold)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub registry: RegistryName,
    pub image: ImageName,
    pub digest: Digest,
    pub vulnerabilities: Vec<Vulnerability>,
    /// Vulnerabilities that violate the policy.
    pub violations: Vec<Vulnerability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanResult {
    pub fn reference(&self) -> String {
        format!("{}@{}", self.registry.join(&self.image), self.digest)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub results: Vec<ScanResult>,
    pub findings: Vec<String>,
    pub cancelled: bool,
}

impl ScanSummary {
    pub fn violations(&self) -> usize {
        self.results.iter().map(|r| r.violations.len()).sum()
    }

    pub fn errors(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }

    pub fn into_result(self) -> Result<ScanSummary, AggregateRunError> {
        let clean = self.errors() == 0 && self.violations() == 0;
        if clean && !self.cancelled && self.findings.is_empty() {
            return Ok(self);
        }
        let mut findings = self.findings.clone();
        for result in &self.results {
            if let Some(error) = &result.error {
                findings.push(error.clone());
            }
            for vulnerability in &result.violations {
                findings.push(format!(
                    "{}: {} ({})",
                    result.reference(),
                    vulnerability.id,
                    vulnerability.severity
                ));
            }
        }
        Err(AggregateRunError {
            failed: self
                .results
                .iter()
                .filter(|r| r.error.is_some() || !r.violations.is_empty())
                .count(),
            skipped: 0,
            cancelled: usize::from(self.cancelled),
            findings,
        })
    }
}

/// Scan the source image of every edge in `plan`.
pub async fn scan_sources(
    plan: &EdgePlan,
    scanner: Arc<dyn VulnerabilityScanner>,
    policy: ScanPolicy,
    concurrency: usize,
    cancel: &Cancellation,
) -> ScanSummary {
    let targets: BTreeSet<(RegistryName, ImageName, Digest)> = plan
        .edges
        .iter()
        .map(|e| (e.src_registry.clone(), e.src_image.clone(), e.digest.clone()))
        .collect();
    tracing::info!(
        images = targets.len(),
        edges = plan.len(),
        "scanning source images"
    );

    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut handles = Vec::with_capacity(targets.len());
    for (registry, image, digest) in targets {
        let scanner = Arc::clone(&scanner);
        let semaphore = Arc::clone(&semaphore);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                permit = semaphore.acquire_owned() => permit.ok()?,
            };
            let (reg, img, dig) = (registry.clone(), image.clone(), digest.clone());
            let scanned = tokio::task::spawn_blocking(move || scanner.scan(&reg, &img, &dig)).await;
            let (vulnerabilities, error) = match scanned {
                Ok(Ok(report)) => (report.vulnerabilities, None),
                Ok(Err(err)) => (Vec::new(), Some(err.to_string())),
                Err(join) => (Vec::new(), Some(format!("scan task failed: {join}"))),
            };
            let violations: Vec<Vulnerability> = vulnerabilities
                .iter()
                .filter(|v| policy.counts(v))
                .cloned()
                .collect();
            if let Some(error) = &error {
                tracing::error!(image = %image, digest = %digest, error = %error, "scan failed");
            } else if !violations.is_empty() {
                tracing::warn!(
                    image = %image,
                    digest = %digest,
                    violations = violations.len(),
                    "vulnerabilities above threshold"
                );
            }
            Some(ScanResult {
                registry,
                image,
                digest,
                vulnerabilities,
                violations,
                error,
            })
        }));
    }

    let mut summary = ScanSummary {
        findings: plan.findings.iter().map(ToString::to_string).collect(),
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok(Some(result)) => summary.results.push(result),
            Ok(None) => {}
            Err(err) => summary.findings.push(format!("scan task join failure: {err}")),
        }
    }
    summary.cancelled = cancel.is_cancelled();
    summary
}
