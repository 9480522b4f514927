//! Mapping registry names onto Distribution API endpoints.

use promo_core::{ImageName, RegistryName};

/// `gcr.io/k8s-artifacts-prod` → host `gcr.io`, namespace
/// `k8s-artifacts-prod`. A bare host has an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistryEndpoint {
    pub host: String,
    pub namespace: String,
}

impl RegistryEndpoint {
    pub fn parse(registry: &RegistryName) -> Self {
        let trimmed = registry.as_str().trim_end_matches('/');
        let without_scheme = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .unwrap_or(trimmed);
        match without_scheme.split_once('/') {
            Some((host, namespace)) => Self {
                host: host.to_string(),
                namespace: namespace.to_string(),
            },
            None => Self {
                host: without_scheme.to_string(),
                namespace: String::new(),
            },
        }
    }

    /// Plain HTTP only for loopback registries.
    pub fn base_url(&self) -> String {
        let local = self.host.starts_with("localhost") || self.host.starts_with("127.0.0.1");
        let scheme = if local { "http" } else { "https" };
        format!("{scheme}://{}", self.host)
    }

    /// Repository path of `image` under this endpoint.
    pub fn repository(&self, image: &ImageName) -> String {
        if self.namespace.is_empty() {
            image.as_str().to_string()
        } else {
            format!("{}/{}", self.namespace, image)
        }
    }

    /// Inverse of [`repository`](Self::repository) for catalog entries.
    pub fn image_for(&self, repository: &str) -> Option<ImageName> {
        if self.namespace.is_empty() {
            return Some(ImageName::from(repository));
        }
        repository
            .strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|rest| !rest.is_empty())
            .map(ImageName::from)
    }
}

/// Extract the `next` target of an RFC 5988 `Link` header as registries send
/// it for paginated listings: `</v2/foo/tags/list?n=100&last=v9>; rel="next"`.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let (target, params) = part.split_once(';')?;
        if !params.contains("rel=\"next\"") {
            return None;
        }
        let target = target.trim();
        target
            .strip_prefix('<')
            .and_then(|t| t.strip_suffix('>'))
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_host_and_namespace() {
        let ep = RegistryEndpoint::parse(&RegistryName::from("gcr.io/k8s-artifacts-prod/sub"));
        assert_eq!(ep.host, "gcr.io");
        assert_eq!(ep.namespace, "k8s-artifacts-prod/sub");
        assert_eq!(
            ep.repository(&ImageName::from("pause")),
            "k8s-artifacts-prod/sub/pause"
        );
        assert_eq!(ep.base_url(), "https://gcr.io");
    }

    #[test]
    fn bare_local_host() {
        let ep = RegistryEndpoint::parse(&RegistryName::from("localhost:5000"));
        assert_eq!(ep.namespace, "");
        assert_eq!(ep.repository(&ImageName::from("foo")), "foo");
        assert_eq!(ep.base_url(), "http://localhost:5000");
    }

    #[test]
    fn catalog_entries_outside_namespace_are_ignored() {
        let ep = RegistryEndpoint::parse(&RegistryName::from("gcr.io/prod"));
        assert_eq!(ep.image_for("prod/foo/bar"), Some(ImageName::from("foo/bar")));
        assert_eq!(ep.image_for("production/foo"), None);
        assert_eq!(ep.image_for("prod"), None);
    }

    #[test]
    fn parses_next_link() {
        let header = r#"</v2/foo/tags/list?n=100&last=v9>; rel="next""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("/v2/foo/tags/list?n=100&last=v9")
        );
        assert_eq!(next_link(r#"</x>; rel="prev""#), None);
    }
}
