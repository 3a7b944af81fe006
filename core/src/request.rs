//! Request value object and its submission-time validation.
//!
//! # Design
//! A `Request` is configured incrementally and then moved into
//! `Client::perform`; after that the caller has no handle to it, so "no
//! mutation after submission" is enforced by ownership. Validation is
//! deferred to submission: an empty or unparseable URL is reported through
//! the completion handler as a configuration error, never at construction.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::dispatch::{CompletionHandler, Outcome};
use crate::error::Error;
use crate::http::{Headers, Method};

/// URL scheme supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Where a request goes, derived from its URL at submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus query, as written on the request line.
    pub path: String,
}

impl Target {
    /// Value for the `Host` header: the port is omitted when it is the
    /// scheme default.
    pub fn authority(&self) -> String {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == self.scheme.default_port() {
            host
        } else {
            format!("{host}:{}", self.port)
        }
    }
}

/// An HTTP request waiting to be performed.
#[derive(Default)]
pub struct Request {
    method: Method,
    url: String,
    body: Bytes,
    headers: Headers,
    timeout: Option<Duration>,
    completion: Option<CompletionHandler>,
}

impl Request {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(url: impl Into<String>) -> Self {
        let mut request = Self::new();
        request.set_url(url);
        request
    }

    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        let mut request = Self::get(url);
        request.set_method_post();
        request.set_body(body);
        request
    }

    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    pub fn set_method_get(&mut self) {
        self.method = Method::Get;
    }

    pub fn set_method_post(&mut self) {
        self.method = Method::Post;
    }

    /// Set the target URL. Not validated until the request is performed.
    pub fn set_url(&mut self, url: impl Into<String>) {
        self.url = url.into();
    }

    /// Set the body. Ignored by the engine for GET and HEAD.
    pub fn set_body(&mut self, body: impl Into<Bytes>) {
        self.body = body.into();
    }

    /// Replace any existing header with this name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.set(name, value);
    }

    pub fn append_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.append(name, value);
    }

    /// Deadline for the whole perform, overriding the client default.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Fall back to the client's request timeout.
    pub fn clear_timeout(&mut self) {
        self.timeout = None;
    }

    /// Register the handler that receives the outcome. Replacing a handler
    /// drops the previous one without calling it.
    pub fn set_completion<F>(&mut self, handler: F)
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.completion = Some(Box::new(handler));
    }

    /// Drop the registered handler without calling it.
    pub fn clear_completion(&mut self) {
        self.completion = None;
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.append_header(name, value);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.set_timeout(timeout);
        self
    }

    pub fn on_complete<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Outcome) + Send + 'static,
    {
        self.set_completion(handler);
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    pub(crate) fn take_completion(&mut self) -> Option<CompletionHandler> {
        self.completion.take()
    }

    /// Body bytes that go on the wire for this method.
    pub(crate) fn wire_body(&self) -> &[u8] {
        if self.method.permits_body() {
            &self.body
        } else {
            &[]
        }
    }

    /// Validate the request and derive where it goes.
    pub fn target(&self) -> Result<Target, Error> {
        if self.url.is_empty() {
            return Err(Error::configuration("empty url"));
        }
        let url = Url::parse(&self.url)
            .map_err(|e| Error::configuration(format!("invalid url {:?}: {e}", self.url)))?;

        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(Error::configuration(format!("unsupported scheme {other:?}"))),
        };
        let host = match url.host_str() {
            Some(h) if !h.is_empty() => h.trim_start_matches('[').trim_end_matches(']').to_string(),
            _ => return Err(Error::configuration(format!("url {:?} has no host", self.url))),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        let mut path = url.path().to_string();
        if path.is_empty() {
            path.push('/');
        }
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }

        for (name, value) in self.headers.iter() {
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                return Err(Error::configuration(format!("invalid header name {name:?}")));
            }
            if value.bytes().any(|b| b == b'\r' || b == b'\n' || b == 0) {
                return Err(Error::configuration(format!("invalid value for header {name:?}")));
            }
        }

        Ok(Target {
            scheme,
            host,
            port,
            path,
        })
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// RFC 9110 `tchar`.
fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
