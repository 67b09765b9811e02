use std::fmt;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

pub const CACHE_BUST_PARAM: &str = "X";
pub const CACHE_BUST_RANGE: u32 = 1000;
pub const BINARY_EXTENSION: &str = ".bin";

pub fn normalize_prefix(prefix: &str) -> String {
    prefix.trim().trim_end_matches('/').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Primary,
    Secondary,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEndpoint {
    primary: String,
    secondary: String,
}

impl ServerEndpoint {
    pub fn new(primary: &str, secondary: &str) -> Self {
        Self {
            primary: normalize_prefix(primary),
            secondary: normalize_prefix(secondary),
        }
    }

    pub fn prefix(&self, source: Source) -> &str {
        match source {
            Source::Primary => &self.primary,
            Source::Secondary => &self.secondary,
        }
    }

    pub fn set_prefix(&mut self, source: Source, prefix: &str) {
        let normalized = normalize_prefix(prefix);
        match source {
            Source::Primary => self.primary = normalized,
            Source::Secondary => self.secondary = normalized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    VersionCheck,
    Binary,
    Certificate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUrl(String);

impl ArtifactUrl {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ArtifactUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedArtifact {
    pub prefix: String,
    pub identifier: String,
    pub nonce: u32,
}

#[derive(Debug)]
pub struct ArtifactLocator {
    rng: StdRng,
}

impl Default for ArtifactLocator {
    fn default() -> Self {
        Self::new()
    }
}

impl ArtifactLocator {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn url(&mut self, prefix: &str, identifier: &str, kind: ArtifactKind) -> ArtifactUrl {
        let nonce = self.rng.gen_range(0..CACHE_BUST_RANGE);
        let url = match kind {
            ArtifactKind::VersionCheck => format!("{prefix}/{identifier}"),
            ArtifactKind::Binary => format!("{prefix}/{identifier}{BINARY_EXTENSION}"),
            ArtifactKind::Certificate => format!("{prefix}{identifier}"),
        };
        ArtifactUrl(format!("{url}?{CACHE_BUST_PARAM}={nonce}"))
    }

    pub fn firmware_version_url(
        &mut self,
        endpoint: &ServerEndpoint,
        source: Source,
        app_id: &str,
    ) -> ArtifactUrl {
        let marker = format!("{app_id}.txt");
        self.url(endpoint.prefix(source), &marker, ArtifactKind::VersionCheck)
    }

    pub fn firmware_url(
        &mut self,
        endpoint: &ServerEndpoint,
        source: Source,
        app_id: &str,
    ) -> ArtifactUrl {
        self.url(endpoint.prefix(source), app_id, ArtifactKind::Binary)
    }

    pub fn certificate_version_url(
        &mut self,
        endpoint: &ServerEndpoint,
        source: Source,
    ) -> ArtifactUrl {
        self.url(
            endpoint.prefix(source),
            crate::certs::CERT_VERSION_FILE,
            ArtifactKind::VersionCheck,
        )
    }

    pub fn certificate_url(
        &mut self,
        endpoint: &ServerEndpoint,
        source: Source,
        file_name: &str,
    ) -> ArtifactUrl {
        self.url(endpoint.prefix(source), file_name, ArtifactKind::Certificate)
    }

    pub fn parse(url: &str, kind: ArtifactKind) -> Option<ParsedArtifact> {
        let (path, query) = url.rsplit_once('?')?;
        let nonce = query
            .strip_prefix(CACHE_BUST_PARAM)?
            .strip_prefix('=')?
            .parse::<u32>()
            .ok()?;
        let split = path.rfind('/')?;
        let (prefix, identifier) = match kind {
            ArtifactKind::VersionCheck => (&path[..split], &path[split + 1..]),
            ArtifactKind::Binary => (
                &path[..split],
                path[split + 1..].strip_suffix(BINARY_EXTENSION)?,
            ),
            ArtifactKind::Certificate => (&path[..split], &path[split..]),
        };
        Some(ParsedArtifact {
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
            nonce,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn normalize_strips_trailing_slash() {
        assert_eq!(normalize_prefix("http://x/ota/"), "http://x/ota");
        assert_eq!(normalize_prefix("http://x/ota"), "http://x/ota");
    }

    #[test]
    fn normalize_is_idempotent() {
        for prefix in ["http://x/ota/", "http://x/ota", "http://h:8000/ota/cert/", ""] {
            let once = normalize_prefix(prefix);
            assert_eq!(normalize_prefix(&once), once);
        }
    }

    #[test]
    fn endpoint_normalizes_on_ingestion() {
        let mut endpoint = ServerEndpoint::new("http://a/ota1/", "http://b:8000/ota");
        assert_eq!(endpoint.prefix(Source::Primary), "http://a/ota1");
        assert_eq!(endpoint.prefix(Source::Secondary), "http://b:8000/ota");

        endpoint.set_prefix(Source::Secondary, "http://c/fw/");
        assert_eq!(endpoint.prefix(Source::Secondary), "http://c/fw");
    }

    #[test]
    fn binary_url_round_trips() {
        let mut locator = ArtifactLocator::with_seed(7);
        for _ in 0..50 {
            let url = locator.url("http://x/ota", "bath", ArtifactKind::Binary);
            assert!(url.as_str().starts_with("http://x/ota/bath.bin?X="));

            let parsed = ArtifactLocator::parse(url.as_str(), ArtifactKind::Binary).unwrap();
            assert_eq!(parsed.prefix, "http://x/ota");
            assert_eq!(parsed.identifier, "bath");
            assert!(parsed.nonce < CACHE_BUST_RANGE);
        }
    }

    #[test]
    fn certificate_url_has_no_extra_separator() {
        let mut locator = ArtifactLocator::with_seed(1);
        let endpoint = ServerEndpoint::new("http://x/cert1/", "http://y/cert2");
        let url = locator.certificate_url(&endpoint, Source::Primary, "/ca.der");
        assert!(url.as_str().starts_with("http://x/cert1/ca.der?X="));

        let parsed = ArtifactLocator::parse(url.as_str(), ArtifactKind::Certificate).unwrap();
        assert_eq!(parsed.prefix, "http://x/cert1");
        assert_eq!(parsed.identifier, "/ca.der");
    }

    #[test]
    fn version_urls() {
        let mut locator = ArtifactLocator::with_seed(3);
        let endpoint = ServerEndpoint::new("http://x/ota", "http://y/ota/");

        let fw = locator.firmware_version_url(&endpoint, Source::Secondary, "bath");
        assert!(fw.as_str().starts_with("http://y/ota/bath.txt?X="));

        let cert = locator.certificate_version_url(&endpoint, Source::Primary);
        assert!(cert.as_str().starts_with("http://x/ota/certversion.txt?X="));
    }

    #[test]
    fn parse_rejects_missing_cache_buster() {
        assert_eq!(
            ArtifactLocator::parse("http://x/ota/bath.bin", ArtifactKind::Binary),
            None
        );
        assert_eq!(
            ArtifactLocator::parse("http://x/ota/bath.txt?X=1", ArtifactKind::Binary),
            None
        );
    }
}
