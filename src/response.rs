//! Response delivery types.

use bytes::Bytes;

/// A complete reply on one stream: the decompressed name/value list
/// (SYN_REPLY plus any trailing HEADERS frames) and the concatenated
/// DATA payload.
#[derive(Debug, Clone)]
pub struct Response {
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl Response {
    pub fn new(headers: Vec<(String, String)>, body: Bytes) -> Self {
        Self { headers, body }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// First value for a header name (SPDY names are lowercase on the wire).
    pub fn header(&self, name: &str) -> Option<&str> {
        let name_lower = name.to_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name_lower)
            .map(|(_, v)| v.as_str())
    }

    /// The raw `:status` value, e.g. "200 OK".
    pub fn status(&self) -> Option<&str> {
        self.header(":status")
    }

    /// Numeric portion of the `:status` value.
    pub fn status_code(&self) -> Option<u16> {
        let status = self.status()?;
        let digits = status.split_whitespace().next()?;
        digits.parse().ok()
    }

    pub fn is_success(&self) -> bool {
        self.status_code().is_some_and(|code| (200..300).contains(&code))
    }
}

/// A server-pushed stream delivered in full.
#[derive(Debug, Clone)]
pub struct PushedResponse {
    /// The (even) id the server assigned to the pushed stream.
    pub stream_id: u32,
    /// The local stream this push is associated with.
    pub associated_stream_id: u32,
    pub response: Response,
}
