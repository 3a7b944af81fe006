//! Asynchronous HTTP/1.1 request engine.
//!
//! # Overview
//! A `Request` is configured on the caller's thread and handed to
//! `Client::perform`, which returns at once. The exchange runs on the
//! client's background tokio runtime and its outcome, a `Response` or an
//! `Error`, is delivered exactly once to the completion handler registered on
//! the request.
//!
//! # Design
//! - `Client` owns the runtime, the connection pool and the transport.
//!   Dropping it cancels (or drains) pending performs and waits until every
//!   handler has run.
//! - Completion handlers are owned `FnOnce` closures; the `ffi` crate maps
//!   the C callback, context and deleter onto one.
//! - Network access goes through the `Transport` and `Resolve` traits, so the
//!   engine can be driven by in-process streams in tests.
//! - Only HTTP/1.1 is spoken: no HTTP/2, cookies, redirects or proxies.

pub mod client;
mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod pool;
pub mod request;
pub mod response;
pub mod transport;

pub use client::{Client, ClientBuilder, PerformHandle};
pub use config::{ClientConfig, PoolConfig, ShutdownPolicy, TlsConfig};
pub use dispatch::{CompletionHandler, Outcome};
pub use error::{BuildError, ConfigError, Error, ErrorKind};
pub use http::{Headers, Method, Version};
pub use pool::{PoolKey, PoolStats};
pub use request::{Request, Scheme, Target};
pub use response::Response;
pub use transport::{load_tls_config, BoxIo, GaiResolver, Io, Resolve, TcpTransport, Transport};
