//! Shared fixtures for engine tests: an in-process transport and helpers
//! for collecting outcomes on the test thread.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use futures::future::BoxFuture;
use liberty_core::{BoxIo, ClientConfig, Error, Outcome, Target, Transport};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small runtime, short deadlines.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default();
    config.worker_threads = 2;
    config.request_timeout_ms = 5_000;
    config.connect_timeout_ms = 1_000;
    config
}

/// How the fake peer answers each request it reads.
#[derive(Clone, Debug)]
pub enum Reply {
    /// `200 OK` carrying the request body; the connection stays open.
    Echo,
    /// Like `Echo`, after a delay.
    DelayedEcho(Duration),
    /// Write these bytes, then close the connection.
    Raw(&'static [u8]),
    /// Write these bytes and wait for the next request.
    KeepAlive(&'static [u8]),
    /// Never answer; wait until the client goes away.
    Hang,
    /// Close the peer before the request is written.
    Gone,
}

/// Transport whose connections are served by an in-process task.
pub struct FakeTransport {
    reply: Reply,
    connect_delay: Option<Duration>,
    connects: AtomicUsize,
}

impl FakeTransport {
    pub fn new(reply: Reply) -> Arc<Self> {
        Arc::new(Self {
            reply,
            connect_delay: None,
            connects: AtomicUsize::new(0),
        })
    }

    pub fn with_connect_delay(reply: Reply, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply,
            connect_delay: Some(delay),
            connects: AtomicUsize::new(0),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Transport for FakeTransport {
    fn connect<'a>(&'a self, _target: &'a Target) -> BoxFuture<'a, Result<BoxIo, Error>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.connect_delay {
                tokio::time::sleep(delay).await;
            }
            let (client, server) = duplex(64 * 1024);
            match self.reply {
                Reply::Gone => drop(server),
                _ => {
                    tokio::spawn(serve(server, self.reply.clone()));
                }
            }
            Ok::<BoxIo, Error>(Box::new(client))
        })
    }
}

async fn serve(mut io: DuplexStream, reply: Reply) {
    let mut buf = Vec::new();
    while let Some(body) = read_request(&mut io, &mut buf).await {
        match &reply {
            Reply::Echo => {
                if write_echo(&mut io, &body).await.is_err() {
                    return;
                }
            }
            Reply::DelayedEcho(delay) => {
                tokio::time::sleep(*delay).await;
                if write_echo(&mut io, &body).await.is_err() {
                    return;
                }
            }
            Reply::Raw(bytes) => {
                let _ = io.write_all(bytes).await;
                let _ = io.shutdown().await;
                return;
            }
            Reply::KeepAlive(bytes) => {
                if io.write_all(bytes).await.is_err() {
                    return;
                }
            }
            Reply::Gone => return,
            Reply::Hang => {
                let mut rest = [0u8; 1024];
                while matches!(io.read(&mut rest).await, Ok(n) if n > 0) {}
                return;
            }
        }
    }
}

async fn write_echo(io: &mut DuplexStream, body: &[u8]) -> std::io::Result<()> {
    let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len());
    io.write_all(head.as_bytes()).await?;
    io.write_all(body).await
}

/// Read one request and return its body, or `None` once the client closes.
async fn read_request(io: &mut DuplexStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (head_len, body_len) = loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut request = httparse::Request::new(&mut headers);
        if let Ok(httparse::Status::Complete(len)) = request.parse(buf) {
            let body_len = request
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            break (len, body_len);
        }
        if !fill(io, buf).await {
            return None;
        }
    };
    while buf.len() < head_len + body_len {
        if !fill(io, buf).await {
            return None;
        }
    }
    let body = buf[head_len..head_len + body_len].to_vec();
    buf.drain(..head_len + body_len);
    Some(body)
}

async fn fill(io: &mut DuplexStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match io.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

/// Completion handler forwarding the outcome to `tx`.
pub fn forward(tx: &mpsc::Sender<Outcome>) -> impl FnOnce(Outcome) + Send + 'static {
    let tx = tx.clone();
    move |outcome| {
        let _ = tx.send(outcome);
    }
}

/// Start the mock server on an ephemeral port in a background thread and
/// return its address.
pub fn start_mock_server() -> std::net::SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    addr
}
