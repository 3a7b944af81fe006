//! Successful outcome of a perform.

use bytes::Bytes;

use crate::http::{Headers, Version};

/// A fully received HTTP response.
///
/// Only constructed after a complete status line, header block and body were
/// read according to the response's framing. Ownership moves into the
/// completion handler.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    reason: String,
    version: Version,
    headers: Headers,
    body: Bytes,
}

impl Response {
    pub(crate) fn new(
        status: u16,
        reason: String,
        version: Version,
        headers: Headers,
        body: Bytes,
    ) -> Self {
        Self {
            status,
            reason,
            version,
            headers,
            body,
        }
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_size(&self) -> usize {
        self.body.len()
    }

    /// Take the body out of the response.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
