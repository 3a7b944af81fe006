//! Establishing byte streams to a request target.
//!
//! # Design
//! The engine never opens sockets itself. It asks a `Transport` for a boxed
//! `Io` stream to a `Target`, which keeps the pool and codec independent of
//! TCP and TLS and lets tests plug in in-process streams. Name resolution is
//! a second seam (`Resolve`) used by the default `TcpTransport`.
//!
//! Trust policy is not decided here: https needs a `rustls::ClientConfig`
//! supplied by the embedder (or loaded from a PEM bundle named in the
//! config). Without one, https requests fail with a TLS error.

use std::fs::File;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{BuildError, Error};
use crate::request::{Scheme, Target};

/// A bidirectional byte stream carrying one HTTP/1.1 connection.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxIo = Box<dyn Io>;

/// Resolves a host name to candidate socket addresses.
pub trait Resolve: Send + Sync + 'static {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;
}

/// Resolver backed by the system's `getaddrinfo` via tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaiResolver;

impl Resolve for GaiResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
            Ok::<_, io::Error>(addrs)
        })
    }
}

/// Opens connections for the engine. Errors must already be classified as
/// resolve, connect or TLS failures.
pub trait Transport: Send + Sync + 'static {
    fn connect<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<BoxIo, Error>>;
}

/// TCP transport with optional TLS.
pub struct TcpTransport {
    resolver: Arc<dyn Resolve>,
    tls: Option<TlsConnector>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            resolver: Arc::new(GaiResolver),
            tls: None,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(TlsConnector::from(config));
        self
    }

    async fn open(&self, target: &Target) -> Result<BoxIo, Error> {
        match target.scheme {
            Scheme::Http => {
                let stream = self.connect_tcp(target).await?;
                Ok(Box::new(stream))
            }
            Scheme::Https => {
                let connector = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::tls("no TLS context configured"))?;
                let name = ServerName::try_from(target.host.clone())
                    .map_err(|e| Error::tls(format!("invalid server name {:?}: {e}", target.host)))?;
                let stream = self.connect_tcp(target).await?;
                let stream = connector.connect(name, stream).await.map_err(Error::tls)?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn connect_tcp(&self, target: &Target) -> Result<TcpStream, Error> {
        let addrs = self
            .resolver
            .resolve(&target.host, target.port)
            .await
            .map_err(|e| Error::resolve(format!("{}: {e}", target.host)))?;
        if addrs.is_empty() {
            return Err(Error::resolve(format!("{}: no addresses", target.host)));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    debug!(%addr, "tcp connected");
                    let _ = stream.set_nodelay(true);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "tcp connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::connect(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no address could be connected")
        })))
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, target: &'a Target) -> BoxFuture<'a, Result<BoxIo, Error>> {
        Box::pin(self.open(target))
    }
}

/// Build a TLS client context trusting the certificates in a PEM bundle.
pub fn load_tls_config(path: &Path) -> Result<Arc<rustls::ClientConfig>, BuildError> {
    let file = File::open(path).map_err(|e| BuildError::Tls(format!("{}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| BuildError::Tls(format!("{}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| BuildError::Tls(format!("{}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(BuildError::Tls(format!("{}: no certificates found", path.display())));
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}
