//! Vulnerability lookups against an HTTP scanning service.
//!
//! The service is asked for one image reference at a time:
//!
//! ```text
//! GET {endpoint}/v1/scan?image=gcr.io/staging/foo@sha256:...
//! ```
//!
//! and answers with a [`ScanReport`] document:
//!
//! ```json
//! {"vulnerabilities": [{"id": "CVE-2024-0001", "severity": "high", "fix_available": true}]}
//! ```
//!
//! A 404 means the service holds no analysis for the image, which is
//! reported as an error rather than a clean result.

use std::time::Duration;

use promo_core::{Digest, ImageName, RegistryName, ScanError, ScanReport, VulnerabilityScanner};

pub struct HttpScanner {
    agent: ureq::Agent,
    endpoint: String,
    token: Option<String>,
}

impl HttpScanner {
    pub fn new(endpoint: impl Into<String>, token: Option<String>, timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn fetch(&self, reference: &str) -> Result<ScanReport, String> {
        let mut request = self
            .agent
            .get(&format!("{}/v1/scan", self.endpoint))
            .query("image", reference);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        match request.call() {
            Ok(response) => response
                .into_json::<ScanReport>()
                .map_err(|e| format!("invalid scan report: {e}")),
            Err(ureq::Error::Status(404, _)) => Err("no vulnerability analysis available".to_string()),
            Err(ureq::Error::Status(status, _)) => Err(format!("scanner returned HTTP {status}")),
            Err(ureq::Error::Transport(transport)) => Err(transport.to_string()),
        }
    }
}

impl VulnerabilityScanner for HttpScanner {
    fn scan(
        &self,
        registry: &RegistryName,
        image: &ImageName,
        digest: &Digest,
    ) -> Result<ScanReport, ScanError> {
        let reference = format!("{}@{digest}", registry.join(image));
        self.fetch(&reference).map_err(|reason| ScanError {
            image: reference,
            reason,
        })
    }
}

/// Stand-in when no scanning service is configured: every scan fails with
/// a clear message instead of silently passing.
pub struct UnconfiguredScanner;

impl VulnerabilityScanner for UnconfiguredScanner {
    fn scan(
        &self,
        registry: &RegistryName,
        image: &ImageName,
        digest: &Digest,
    ) -> Result<ScanReport, ScanError> {
        Err(ScanError {
            image: format!("{}@{digest}", registry.join(image)),
            reason: "no vulnerability scanner configured (--scanner-url)".to_string(),
        })
    }
}
