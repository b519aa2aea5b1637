//! Request description queued onto a session.

use bytes::Bytes;
use http::{Method, Uri};

/// One application request to multiplex onto the session.
///
/// The method and target are mapped to the `:method` / `:path` / `:host` /
/// `:scheme` / `:version` pseudo-headers when the stream is opened.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub priority: u8,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
            priority: 0,
        }
    }

    pub fn get(uri: Uri) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Stream priority, 0 (highest) through 7 (lowest).
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(7);
        self
    }

    /// The full SPDY header list for this request, pseudo-headers first.
    pub(crate) fn to_spdy_headers(&self) -> Vec<(String, String)> {
        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let host = self.uri.authority().map(|a| a.as_str()).unwrap_or("");
        let scheme = self.uri.scheme_str().unwrap_or("https");

        let mut headers = vec![
            (":method".to_string(), self.method.as_str().to_string()),
            (":path".to_string(), path.to_string()),
            (":version".to_string(), "HTTP/1.1".to_string()),
            (":host".to_string(), host.to_string()),
            (":scheme".to_string(), scheme.to_string()),
        ];
        for (name, value) in &self.headers {
            headers.push((name.to_lowercase(), value.clone()));
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pseudo_headers_come_first() {
        let request = Request::get("https://example.com/a?b=1".parse().unwrap())
            .header("Accept", "text/html");
        let headers = request.to_spdy_headers();
        assert_eq!(headers[0], (":method".to_string(), "GET".to_string()));
        assert_eq!(headers[1], (":path".to_string(), "/a?b=1".to_string()));
        assert_eq!(headers[3], (":host".to_string(), "example.com".to_string()));
        assert_eq!(headers[5], ("accept".to_string(), "text/html".to_string()));
    }

    #[test]
    fn test_priority_clamped() {
        let request = Request::get("https://example.com/".parse().unwrap()).priority(9);
        assert_eq!(request.priority, 7);
    }
}
