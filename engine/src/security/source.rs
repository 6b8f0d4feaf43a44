//! Package origin checks against the trusted/blocked source lists

use sdk::errors::EngineError;
use url::Url;

/// Classification of a package origin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceVerdict {
    Trusted,
    Blocked,
    /// Matches neither list; the active policy decides
    Unknown,
}

/// Allow-list and deny-list of package origins
///
/// A pattern containing `://` is a URL prefix; anything else is a host
/// pattern where `*.example.com` matches `example.com` and its subdomains.
/// The deny-list wins when both match.
#[derive(Debug, Clone, Default)]
pub struct SourcePolicy {
    trusted: Vec<SourcePattern>,
    blocked: Vec<SourcePattern>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SourcePattern {
    Host(String),
    /// Same scheme, host and port; path matched on whole segments
    Prefix {
        scheme: String,
        host: String,
        port: Option<u16>,
        path: String,
    },
}

impl SourcePattern {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim().to_ascii_lowercase();
        if raw.is_empty() {
            return None;
        }
        if !raw.contains("://") {
            return Some(Self::Host(raw));
        }

        let url = match Url::parse(&raw) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(pattern = %raw, "Ignoring unparseable source pattern: {}", e);
                return None;
            }
        };
        let Some(host) = url.host_str() else {
            tracing::warn!(pattern = %raw, "Ignoring source pattern without a host");
            return None;
        };
        Some(Self::Prefix {
            scheme: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port_or_known_default(),
            path: url.path().to_string(),
        })
    }

    fn matches(&self, url: &Url, host: &str) -> bool {
        match self {
            Self::Host(pattern) => domain_matches(host, pattern),
            Self::Prefix {
                scheme,
                host: pattern_host,
                port,
                path,
            } => {
                url.scheme() == scheme.as_str()
                    && host == pattern_host.as_str()
                    && url.port_or_known_default() == *port
                    && path_within(&url.path().to_ascii_lowercase(), path)
            }
        }
    }
}

/// `path` equals `prefix` or continues it after a `/`
fn path_within(path: &str, prefix: &str) -> bool {
    if prefix.ends_with('/') {
        return path.starts_with(prefix);
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

impl SourcePolicy {
    pub fn new(trusted: &[String], blocked: &[String]) -> Self {
        let parse_all = |patterns: &[String]| -> Vec<SourcePattern> {
            patterns.iter().filter_map(|p| SourcePattern::parse(p)).collect()
        };
        Self {
            trusted: parse_all(trusted),
            blocked: parse_all(blocked),
        }
    }

    /// Classify a source URL
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` if the URL cannot be parsed or has no host.
    pub fn classify(&self, source_url: &str) -> Result<SourceVerdict, EngineError> {
        let url = Url::parse(source_url)
            .map_err(|e| EngineError::Config(format!("Invalid source URL '{}': {}", source_url, e)))?;

        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Config(format!("Source URL '{}' has no host", source_url)))?
            .to_ascii_lowercase();

        if self.blocked.iter().any(|p| p.matches(&url, &host)) {
            return Ok(SourceVerdict::Blocked);
        }
        if self.trusted.iter().any(|p| p.matches(&url, &host)) {
            return Ok(SourceVerdict::Trusted);
        }
        Ok(SourceVerdict::Unknown)
    }
}

pub fn domain_matches(host: &str, pattern: &str) -> bool {
    match pattern.strip_prefix("*.") {
        Some(apex) => host == apex || host.ends_with(&format!(".{}", apex)),
        None => host == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SourcePolicy {
        SourcePolicy::new(
            &[
                "*.plexus.dev".to_string(),
                "https://cdn.example.com/plugins/".to_string(),
            ],
            &["evil.plexus.dev".to_string()],
        )
    }

    #[test]
    fn test_wildcard_host() {
        let p = policy();
        assert_eq!(p.classify("https://plexus.dev/a.json").unwrap(), SourceVerdict::Trusted);
        assert_eq!(
            p.classify("https://store.plexus.dev/a.json").unwrap(),
            SourceVerdict::Trusted
        );
        assert_eq!(
            p.classify("https://notplexus.dev/a.json").unwrap(),
            SourceVerdict::Unknown
        );
    }

    #[test]
    fn test_url_prefix() {
        let p = policy();
        assert_eq!(
            p.classify("https://cdn.example.com/plugins/x.json").unwrap(),
            SourceVerdict::Trusted
        );
        assert_eq!(
            p.classify("https://cdn.example.com/other/x.json").unwrap(),
            SourceVerdict::Unknown
        );
    }

    #[test]
    fn test_url_prefix_requires_exact_host() {
        let p = SourcePolicy::new(&["https://cdn.example.com".to_string()], &[]);
        assert_eq!(
            p.classify("https://cdn.example.com/pkg.zip").unwrap(),
            SourceVerdict::Trusted
        );
        assert_eq!(
            p.classify("https://cdn.example.com.evil.net/pkg.zip").unwrap(),
            SourceVerdict::Unknown
        );
        assert_eq!(
            p.classify("https://cdn.example.com@evil.net/pkg.zip").unwrap(),
            SourceVerdict::Unknown
        );
        assert_eq!(
            p.classify("http://cdn.example.com/pkg.zip").unwrap(),
            SourceVerdict::Unknown
        );
        assert_eq!(
            p.classify("https://cdn.example.com:8443/pkg.zip").unwrap(),
            SourceVerdict::Unknown
        );
    }

    #[test]
    fn test_url_prefix_matches_whole_segments() {
        let p = SourcePolicy::new(&["https://cdn.example.com/plugins".to_string()], &[]);
        assert_eq!(
            p.classify("https://cdn.example.com/plugins/x.json").unwrap(),
            SourceVerdict::Trusted
        );
        assert_eq!(
            p.classify("https://cdn.example.com/plugins-evil/x.json").unwrap(),
            SourceVerdict::Unknown
        );
    }

    #[test]
    fn test_blocked_wins() {
        assert_eq!(
            policy().classify("https://EVIL.plexus.dev/x").unwrap(),
            SourceVerdict::Blocked
        );
    }

    #[test]
    fn test_unparseable_url() {
        assert!(policy().classify("not a url").is_err());
    }
}
