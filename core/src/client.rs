//! The execution engine: `Client` and its background runtime.
//!
//! # Design
//! A `Client` owns a multi-threaded tokio runtime. `perform` moves the
//! request into a task on that runtime and returns a `PerformHandle` at once;
//! it never touches a socket and never runs the completion handler itself.
//!
//! Each task races three futures with `tokio::select!`: the caller's cancel
//! signal, the client's shutdown signal, and the exchange under its deadline.
//! Whichever wins decides the single outcome handed to `Dispatch`. The losing
//! exchange future is dropped mid-flight, which drops its connection instead
//! of returning it to the pool.
//!
//! Dropping the client applies the configured `ShutdownPolicy`, then waits on
//! the in-flight counter until every task has dispatched before the runtime
//! is shut down.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::{Handle, Runtime};
use tokio::sync::watch;
use tokio::time;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::codec::{self, Limits};
use crate::config::{ClientConfig, ShutdownPolicy};
use crate::dispatch::{Dispatch, Outcome};
use crate::error::{BuildError, Error};
use crate::pool::{Pool, PoolKey, PoolStats};
use crate::request::{Request, Target};
use crate::transport::{load_tls_config, BoxIo, TcpTransport, Transport};

/// How long `Drop` lets the runtime finish blocking work after every
/// perform has dispatched.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Configures and starts a `Client`.
#[derive(Default)]
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Arc<dyn Transport>>,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the default TCP/TLS transport.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// TLS context for https with the default transport. Takes precedence
    /// over `tls.ca_file` in the config.
    pub fn tls_config(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn build(self) -> Result<Client, BuildError> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => {
                let tls = match (self.tls, &self.config.tls.ca_file) {
                    (Some(tls), _) => Some(tls),
                    (None, Some(path)) => Some(load_tls_config(path)?),
                    (None, None) => None,
                };
                let mut transport = TcpTransport::new();
                if let Some(tls) = tls {
                    transport = transport.with_tls(tls);
                }
                Arc::new(transport)
            }
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.worker_threads)
            .thread_name("liberty-worker")
            .enable_all()
            .build()
            .map_err(BuildError::Runtime)?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (in_flight, _) = watch::channel(0usize);
        let pool = Pool::new(self.config.pool.clone());
        pool.spawn_reaper(runtime.handle(), shutdown_rx);

        info!(
            worker_threads = self.config.worker_threads,
            max_connections_per_host = self.config.pool.max_connections_per_host,
            "client started"
        );

        Ok(Client {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            shared: Arc::new(Shared {
                config: self.config,
                pool,
                transport,
                shutdown,
                in_flight,
            }),
        })
    }
}

/// Performs requests on a background runtime.
pub struct Client {
    handle: Handle,
    runtime: Option<Runtime>,
    shared: Arc<Shared>,
}

impl Client {
    /// A client with the default configuration.
    pub fn new() -> Result<Self, BuildError> {
        ClientBuilder::new().build()
    }

    pub fn with_config(config: ClientConfig) -> Result<Self, BuildError> {
        ClientBuilder::new().config(config).build()
    }

    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Submit a request. Returns immediately; the outcome arrives through
    /// the request's completion handler on a runtime worker thread, exactly
    /// once. Dropping the returned handle does not cancel the request.
    pub fn perform(&self, mut request: Request) -> PerformHandle {
        let id = Uuid::new_v4();
        let (cancel, cancel_rx) = watch::channel(false);
        let (finished_tx, finished) = watch::channel(false);

        let task = Task {
            dispatch: Dispatch::new(request.take_completion(), finished_tx),
            _in_flight: InFlight::enter(&self.shared),
        };
        let span = info_span!(
            "perform",
            request_id = %id,
            method = %request.method(),
            url = %request.url()
        );
        let shared = Arc::clone(&self.shared);

        self.handle.spawn(
            async move {
                let outcome = shared.run(request, cancel_rx).await;
                match &outcome {
                    Ok(response) => debug!(status = response.status_code(), "perform completed"),
                    Err(err) => debug!(%err, "perform failed"),
                }
                task.complete(outcome);
            }
            .instrument(span),
        );

        PerformHandle { id, cancel, finished }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Performs submitted but not yet dispatched.
    pub fn in_flight(&self) -> usize {
        *self.shared.in_flight.borrow()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        let pending = self.in_flight();

        if Handle::try_current().is_ok() {
            // No blocking inside a runtime. Every task is dropped and its
            // dispatch reports `cancelled`.
            warn!(pending, "client dropped inside an async context, cancelling without waiting");
            self.shared.shutdown.send_replace(true);
            runtime.shutdown_background();
            return;
        }

        if self.shared.config.shutdown == ShutdownPolicy::Cancel {
            self.shared.shutdown.send_replace(true);
        }
        debug!(pending, policy = ?self.shared.config.shutdown, "client shutting down");

        let mut in_flight = self.shared.in_flight.subscribe();
        runtime.block_on(async move {
            let _ = in_flight.wait_for(|count| *count == 0).await;
        });
        self.shared.shutdown.send_replace(true);
        runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        info!("client stopped");
    }
}

/// Caller's view of one submitted perform.
#[derive(Debug)]
pub struct PerformHandle {
    id: Uuid,
    cancel: watch::Sender<bool>,
    finished: watch::Receiver<bool>,
}

impl PerformHandle {
    /// Request id, also recorded on the perform's tracing span.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Ask the perform to stop. Safe to call at any time and from any
    /// thread; has no effect once the outcome has been produced.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    /// Whether the completion handler has run.
    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }
}

struct Shared {
    config: ClientConfig,
    pool: Pool,
    transport: Arc<dyn Transport>,
    shutdown: watch::Sender<bool>,
    in_flight: watch::Sender<usize>,
}

impl Shared {
    async fn run(&self, request: Request, mut cancel: watch::Receiver<bool>) -> Outcome {
        let mut shutdown = self.shutdown.subscribe();
        let deadline = request.timeout().or_else(|| self.config.request_timeout());

        tokio::select! {
            biased;
            _ = signalled(&mut cancel) => Err(Error::cancelled("request cancelled")),
            _ = signalled(&mut shutdown) => Err(Error::cancelled("client shutting down")),
            outcome = self.execute_within(request, deadline) => outcome,
        }
    }

    async fn execute_within(&self, request: Request, deadline: Option<Duration>) -> Outcome {
        match deadline {
            Some(limit) => time::timeout(limit, self.execute(request))
                .await
                .unwrap_or_else(|_| Err(Error::timeout(format!("request timed out after {limit:?}")))),
            None => self.execute(request).await,
        }
    }

    async fn execute(&self, request: Request) -> Outcome {
        let target = request.target()?;
        if !request.method().permits_body() && !request.body().is_empty() {
            debug!(method = %request.method(), "request body ignored for this method");
        }

        let mut checkout = self.pool.acquire(&PoolKey::from_target(&target)).await?;
        let mut conn = match checkout.take_idle() {
            Some(conn) => conn,
            None => {
                let io = self.connect(&target).await?;
                checkout.open(io)
            }
        };
        debug!(conn = conn.id, key = %checkout.key(), "exchange started");

        let wire = codec::encode_request(&request, &target, self.config.user_agent.as_deref());
        codec::write_request(&mut conn.io, &wire).await?;

        let limits = Limits {
            max_head: self.config.max_response_head_bytes,
            max_body: self.config.max_response_body_bytes,
        };
        let (response, reusable) =
            codec::read_response(&mut conn.io, &mut conn.read_buf, request.method(), limits).await?;

        let healthy = reusable && !request.headers().has_token("connection", "close");
        checkout.release(conn, healthy);
        Ok(response)
    }

    async fn connect(&self, target: &Target) -> Result<BoxIo, Error> {
        match self.config.connect_timeout() {
            Some(limit) => time::timeout(limit, self.transport.connect(target))
                .await
                .map_err(|_| {
                    Error::timeout(format!("connect to {} timed out after {limit:?}", target.authority()))
                })?,
            None => self.transport.connect(target).await,
        }
    }
}

/// Resolves once the flag is set. A flag whose sender is gone can no longer
/// be set, so that case never resolves.
async fn signalled(flag: &mut watch::Receiver<bool>) {
    if flag.wait_for(|set| *set).await.is_err() {
        future::pending::<()>().await;
    }
}

/// Everything a spawned perform must settle, in drop order: the dispatch
/// fires before the in-flight count drops.
struct Task {
    dispatch: Dispatch,
    _in_flight: InFlight,
}

impl Task {
    /// Consumes the whole task, so the spawned future owns the in-flight
    /// guard and not just the dispatch.
    fn complete(self, outcome: Outcome) {
        let Task { dispatch, _in_flight: in_flight } = self;
        dispatch.complete(outcome);
        drop(in_flight);
    }
}

struct InFlight {
    shared: Arc<Shared>,
}

impl InFlight {
    fn enter(shared: &Arc<Shared>) -> Self {
        shared.in_flight.send_modify(|count| *count += 1);
        Self {
            shared: Arc::clone(shared),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared
            .in_flight
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::mpsc;

    #[test]
    fn invalid_config_is_rejected_at_build() {
        let mut config = ClientConfig::default();
        config.worker_threads = 0;
        assert!(matches!(Client::with_config(config), Err(BuildError::Config(_))));
    }

    #[test]
    fn missing_ca_bundle_fails_build() {
        let mut config = ClientConfig::default();
        config.tls.ca_file = Some("/nonexistent/ca.pem".into());
        assert!(matches!(Client::with_config(config), Err(BuildError::Tls(_))));
    }

    #[test]
    fn configuration_error_is_dispatched_on_a_worker() {
        let client = Client::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();

        let handle = client.perform(Request::new().on_complete(move |outcome| {
            let _ = tx.send((outcome.map(|_| ()), std::thread::current().id()));
        }));

        let (outcome, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Configuration);
        assert_ne!(thread, caller);
        // The finished flag flips after the handler returns.
        std::thread::sleep(Duration::from_millis(20));
        assert!(handle.is_finished());
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn handles_have_distinct_ids() {
        let client = Client::new().unwrap();
        let a = client.perform(Request::new());
        let b = client.perform(Request::new());
        assert_ne!(a.id(), b.id());
    }

    #[tokio::test]
    async fn drop_inside_runtime_does_not_block() {
        let client = Client::new().unwrap();
        let (tx, rx) = mpsc::channel();
        client.perform(Request::get("http://127.0.0.1:9/").on_complete(move |outcome| {
            let _ = tx.send(outcome.is_err());
        }));
        drop(client);
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
}
