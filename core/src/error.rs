//! Error types for the request engine.
//!
//! # Design
//! Every failure after a request is submitted becomes an `Error` value handed
//! to the completion handler. An `Error` carries a coarse `ErrorKind` that
//! callers branch on, plus an opaque `extra` payload with protocol detail
//! (a raw status line, an I/O error message, a TLS alert) for diagnostics.
//!
//! Errors raised while constructing a client or loading its configuration are
//! separate (`BuildError`, `ConfigError`) because they happen synchronously,
//! before any request exists.

use std::fmt;
use std::io;

use bytes::Bytes;

/// Classification of a failed perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request was invalid before any I/O started (empty or bad URL,
    /// unsupported scheme, header containing CR/LF).
    Configuration,
    /// The target host could not be resolved.
    Resolve,
    /// The TCP connection could not be established.
    Connect,
    /// The TLS handshake failed, or https was requested without a TLS context.
    Tls,
    /// A connect, pool-wait, or request deadline elapsed.
    Timeout,
    /// Writing the request failed (peer reset, broken pipe).
    Write,
    /// Reading the response failed, or the peer closed before responding.
    Read,
    /// The response could not be parsed or violated its declared framing.
    MalformedResponse,
    /// The request was cancelled by the caller or by client shutdown.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration error",
            ErrorKind::Resolve => "resolve failure",
            ErrorKind::Connect => "connect failure",
            ErrorKind::Tls => "tls failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Write => "write failure",
            ErrorKind::Read => "read failure",
            ErrorKind::MalformedResponse => "malformed response",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of one perform.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {}", String::from_utf8_lossy(.extra))]
pub struct Error {
    kind: ErrorKind,
    extra: Bytes,
}

impl Error {
    pub fn new(kind: ErrorKind, extra: impl Into<Bytes>) -> Self {
        Self {
            kind,
            extra: extra.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Diagnostic payload. May be empty.
    pub fn extra(&self) -> &[u8] {
        &self.extra
    }

    pub fn extra_size(&self) -> usize {
        self.extra.len()
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == ErrorKind::Timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    pub(crate) fn configuration(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Configuration, msg.to_string())
    }

    pub(crate) fn resolve(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Resolve, msg.to_string())
    }

    pub(crate) fn connect(err: io::Error) -> Self {
        Self::new(ErrorKind::Connect, err.to_string())
    }

    pub(crate) fn tls(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Tls, msg.to_string())
    }

    pub(crate) fn timeout(msg: impl fmt::Display) -> Self {
        Self::new(ErrorKind::Timeout, msg.to_string())
    }

    pub(crate) fn write(err: io::Error) -> Self {
        Self::new(ErrorKind::Write, err.to_string())
    }

    pub(crate) fn read(err: io::Error) -> Self {
        Self::new(ErrorKind::Read, err.to_string())
    }

    /// The peer closed the stream before sending anything.
    pub(crate) fn read_closed(msg: &'static str) -> Self {
        Self::new(ErrorKind::Read, Bytes::from_static(msg.as_bytes()))
    }

    pub(crate) fn malformed(extra: impl Into<Bytes>) -> Self {
        Self::new(ErrorKind::MalformedResponse, extra)
    }

    pub(crate) fn cancelled(msg: &'static str) -> Self {
        Self::new(ErrorKind::Cancelled, Bytes::from_static(msg.as_bytes()))
    }
}

/// Errors loading or validating a `ClientConfig`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config failed: {0}")]
    Io(#[from] io::Error),

    #[error("parsing config failed: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors constructing a `Client`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The background runtime could not be started.
    #[error("starting runtime failed: {0}")]
    Runtime(io::Error),

    /// The configured CA bundle could not be loaded into a TLS context.
    #[error("loading TLS roots failed: {0}")]
    Tls(String),
}
