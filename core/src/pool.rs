//! Reusable connections keyed by destination.
//!
//! # Design
//! The pool index is a `std::sync::Mutex<HashMap<PoolKey, HostEntry>>`. It is
//! only locked for short, synchronous bookkeeping and never across an
//! `.await`. Each key owns a FIFO `Semaphore` whose permits bound the number
//! of connections checked out at once; waiting for a permit happens outside
//! the lock.
//!
//! A connection is either in its key's idle list or owned by exactly one
//! exchange, which also holds the key's permit through a `Checkout`.
//! Returning a connection to idle storage happens before the permit is
//! released, so the next waiter finds it. A connection that is dropped
//! instead of released is closed; that is how every failure path discards
//! one.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::request::{Scheme, Target};
use crate::transport::BoxIo;

/// Identity of a connection's destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl PoolKey {
    pub fn from_target(target: &Target) -> Self {
        Self {
            scheme: target.scheme,
            host: target.host.clone(),
            port: target.port,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

/// An open connection plus the bytes read from it but not yet consumed.
pub(crate) struct Connection {
    pub(crate) id: u64,
    pub(crate) io: BoxIo,
    pub(crate) read_buf: BytesMut,
    created_at: Instant,
    last_used: Instant,
}

impl Connection {
    fn is_expired(&self, idle_timeout: Option<Duration>) -> bool {
        idle_timeout.is_some_and(|limit| self.last_used.elapsed() >= limit)
    }
}

/// Point-in-time counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections opened over the pool's lifetime.
    pub created: u64,
    /// Connections currently waiting in idle lists.
    pub idle: usize,
    /// Checkouts currently held by exchanges.
    pub checked_out: usize,
}

struct HostEntry {
    idle: VecDeque<Connection>,
    permits: Arc<Semaphore>,
}

struct Inner {
    hosts: Mutex<HashMap<PoolKey, HostEntry>>,
    config: PoolConfig,
    next_id: AtomicU64,
    created: AtomicU64,
    checked_out: AtomicUsize,
}

impl Inner {
    fn hosts(&self) -> MutexGuard<'_, HashMap<PoolKey, HostEntry>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub(crate) struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub(crate) fn new(config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                hosts: Mutex::new(HashMap::new()),
                config,
                next_id: AtomicU64::new(1),
                created: AtomicU64::new(0),
                checked_out: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a slot under the key's cap, then hand out an idle connection
    /// if a fresh one exists. An empty checkout means the caller must open a
    /// connection and `attach` it.
    pub(crate) async fn acquire(&self, key: &PoolKey) -> Result<Checkout, Error> {
        let permits = {
            let mut hosts = self.inner.hosts();
            let cap = self.inner.config.max_connections_per_host;
            let entry = hosts.entry(key.clone()).or_insert_with(|| HostEntry {
                idle: VecDeque::new(),
                permits: Arc::new(Semaphore::new(cap)),
            });
            Arc::clone(&entry.permits)
        };

        let acquired = match self.inner.config.acquire_timeout() {
            Some(limit) => tokio::time::timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| Error::timeout(format!("no connection to {key} available within {limit:?}")))?,
            None => permits.acquire_owned().await,
        };
        let permit = acquired.map_err(|_| Error::cancelled("connection pool closed"))?;

        let idle_timeout = self.inner.config.idle_timeout();
        let (conn, stale) = {
            let mut hosts = self.inner.hosts();
            let mut stale = Vec::new();
            let mut found = None;
            if let Some(entry) = hosts.get_mut(key) {
                while let Some(conn) = entry.idle.pop_back() {
                    if conn.is_expired(idle_timeout) {
                        stale.push(conn);
                    } else {
                        found = Some(conn);
                        break;
                    }
                }
            }
            (found, stale)
        };
        for conn in stale {
            debug!(conn = conn.id, %key, "closing expired idle connection");
        }

        if let Some(conn) = &conn {
            debug!(conn = conn.id, %key, "reusing idle connection");
        }
        self.inner.checked_out.fetch_add(1, Ordering::SeqCst);
        Ok(Checkout {
            key: key.clone(),
            idle: conn,
            pool: Arc::downgrade(&self.inner),
            _permit: permit,
        })
    }

    /// Close idle connections past the idle timeout and forget keys with no
    /// remaining state. Returns how many connections were closed.
    pub(crate) fn evict_expired(&self) -> usize {
        let idle_timeout = self.inner.config.idle_timeout();
        let mut evicted = Vec::new();
        {
            let mut hosts = self.inner.hosts();
            for entry in hosts.values_mut() {
                let (expired, fresh): (VecDeque<_>, VecDeque<_>) =
                    entry.idle.drain(..).partition(|conn| conn.is_expired(idle_timeout));
                entry.idle = fresh;
                evicted.extend(expired);
            }
            // No idle connections, no checkouts and no waiters share the
            // semaphore, so a later acquire can safely start from scratch.
            hosts.retain(|_, entry| !entry.idle.is_empty() || Arc::strong_count(&entry.permits) > 1);
        }
        for conn in &evicted {
            debug!(
                conn = conn.id,
                age_ms = conn.created_at.elapsed().as_millis() as u64,
                "reaped idle connection"
            );
        }
        evicted.len()
    }

    /// Periodically evict expired idle connections until `shutdown` flips or
    /// the pool is dropped. Does nothing when idle connections never expire.
    pub(crate) fn spawn_reaper(&self, runtime: &tokio::runtime::Handle, mut shutdown: watch::Receiver<bool>) {
        let Some(idle_timeout) = self.inner.config.idle_timeout() else {
            return;
        };
        let period = (idle_timeout / 2).max(Duration::from_millis(10));
        let pool = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                Pool { inner }.evict_expired();
            }
        });
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let idle = self.inner.hosts().values().map(|entry| entry.idle.len()).sum();
        PoolStats {
            created: self.inner.created.load(Ordering::SeqCst),
            idle,
            checked_out: self.inner.checked_out.load(Ordering::SeqCst),
        }
    }
}

/// Exclusive use of one slot under a key's cap.
///
/// The engine takes the connection out (`take_idle` or `open`), runs the
/// exchange on it and hands it back through `release`. A connection that is
/// never handed back is simply dropped, which closes it.
pub(crate) struct Checkout {
    key: PoolKey,
    idle: Option<Connection>,
    pool: Weak<Inner>,
    // Declared last: the slot frees only after `release` has stored the
    // connection, so a woken waiter can find it.
    _permit: OwnedSemaphorePermit,
}

impl Checkout {
    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    /// The idle connection handed out by `acquire`, if any.
    pub(crate) fn take_idle(&mut self) -> Option<Connection> {
        self.idle.take()
    }

    /// Wrap a freshly opened stream as a pooled connection.
    pub(crate) fn open(&self, io: BoxIo) -> Connection {
        let now = Instant::now();
        let id = match self.pool.upgrade() {
            Some(inner) => {
                inner.created.fetch_add(1, Ordering::SeqCst);
                inner.next_id.fetch_add(1, Ordering::SeqCst)
            }
            None => 0,
        };
        debug!(conn = id, key = %self.key, "opened new connection");
        Connection {
            id,
            io,
            read_buf: BytesMut::new(),
            created_at: now,
            last_used: now,
        }
    }

    /// Return the connection to idle storage if it can carry another
    /// exchange; otherwise close it.
    pub(crate) fn release(self, mut conn: Connection, healthy: bool) {
        if !healthy {
            debug!(conn = conn.id, key = %self.key, "discarding connection after exchange");
            return;
        }
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        conn.last_used = Instant::now();
        let max_idle = inner.config.max_idle_per_host;
        let mut hosts = inner.hosts();
        match hosts.get_mut(&self.key) {
            Some(entry) if entry.idle.len() < max_idle => {
                debug!(conn = conn.id, key = %self.key, "connection returned to pool");
                entry.idle.push_back(conn);
            }
            _ => {
                debug!(conn = conn.id, key = %self.key, "idle list full, closing connection");
            }
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(conn) = self.idle.take() {
            debug!(conn = conn.id, key = %self.key, "unused idle connection closed");
        }
        if let Some(inner) = self.pool.upgrade() {
            inner.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
