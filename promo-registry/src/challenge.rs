//! `WWW-Authenticate: Bearer ...` challenges and the anonymous token
//! exchange they point at.

use serde::Deserialize;

/// Parsed `Bearer realm="...",service="...",scope="..."` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// `None` for non-Bearer schemes or a challenge without a realm.
    pub fn parse(header: &str) -> Option<Self> {
        let params = header.trim().strip_prefix("Bearer ")?;
        let mut realm = None;
        let mut service = None;
        let mut scope = None;
        for (key, value) in split_params(params) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }
        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

/// Split `k="v",k2="v2"` respecting commas inside quotes
/// (`scope="repository:foo:pull,push"`).
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.split_once('"') {
                Some((value, remainder)) => (value.to_string(), remainder),
                None => (quoted.to_string(), ""),
            },
            None => match after.split_once(',') {
                Some((value, remainder)) => (value.trim().to_string(), remainder),
                None => (after.trim().to_string(), ""),
            },
        };
        out.push((key, value));
        rest = remainder.trim_start_matches(',').trim();
    }
    out
}

/// Token endpoint response. Registries disagree on the field name.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub(crate) fn into_token(self) -> Option<String> {
        self.token.or(self.access_token).filter(|t| !t.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_docker_hub_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull,push""#;
        let challenge = BearerChallenge::parse(header).expect("challenge");
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/nginx:pull,push")
        );
    }

    #[test]
    fn basic_and_realmless_challenges_are_ignored() {
        assert!(BearerChallenge::parse(r#"Basic realm="registry""#).is_none());
        assert!(BearerChallenge::parse(r#"Bearer service="x""#).is_none());
    }

    #[test]
    fn token_field_fallback() {
        let r: TokenResponse = serde_json::from_str(r#"{"access_token":"abc"}"#).expect("json");
        assert_eq!(r.into_token().as_deref(), Some("abc"));
        let r: TokenResponse = serde_json::from_str(r#"{"token":""}"#).expect("json");
        assert_eq!(r.into_token(), None);
    }
}
