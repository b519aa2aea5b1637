//! Origin identity: the (scheme, host, port) tuple keying persisted settings.

use std::fmt;

use url::Url;

use crate::error::{Error, Result};

/// A (scheme, host, port) tuple identifying a server endpoint.
///
/// Used as the key for session-independent state such as persisted SETTINGS.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// Derive an origin from a URL. Fails if the URL has no host or no
    /// resolvable port.
    pub fn from_url(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::InvalidUrl(format!("no host in {}", url)))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| Error::InvalidUrl(format!("no port for {}", url)))?;
        Ok(Self::new(url.scheme(), host, port))
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_default_port() {
        let url = Url::parse("https://example.com/path").unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.scheme(), "https");
        assert_eq!(origin.host(), "example.com");
        assert_eq!(origin.port(), 443);
    }

    #[test]
    fn test_origin_equality() {
        let a = Origin::new("https", "example.com", 443);
        let b = Origin::from_url(&Url::parse("https://example.com:443/").unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "https://example.com:443");
    }
}
