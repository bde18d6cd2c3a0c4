//! Bounded connection pool keyed by route.
//!
//! Connections are HTTP/1.1 `SendRequest` handles. A [`Lease`] holds one
//! while a request and its response body are in flight; dropping the lease
//! either parks the connection as idle or discards it. Waiters for a slot
//! are woken through a [`Notify`].

use crate::config::ProxyConfig;
use crate::error::{HttpError, TimeoutKind};
use bytes::Bytes;
use http_body_util::Full;
use hyper::client::conn::http1::SendRequest;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use url::Url;

pub(crate) type Connection = SendRequest<Full<Bytes>>;

/// Identity of a pooled route
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct RouteKey {
    pub scheme: String,
    /// Host without IPv6 brackets
    pub host: String,
    pub port: u16,
    /// `scheme://host:port` of the forward proxy, if any
    pub proxy: Option<String>,
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(proxy) = &self.proxy {
            write!(f, " via {proxy}")?;
        }
        Ok(())
    }
}

/// Where and how to connect for one request
#[derive(Debug, Clone)]
pub(crate) struct Route {
    pub key: RouteKey,
    pub proxy: Option<Arc<ProxyConfig>>,
}

impl Route {
    /// # Errors
    /// `InvalidArgument` when the URL has no host or usable port.
    pub(crate) fn for_url(url: &Url, proxy: Option<Arc<ProxyConfig>>) -> Result<Self, HttpError> {
        let host = url
            .host_str()
            .ok_or_else(|| HttpError::invalid_argument("missing host", url.to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::invalid_argument("missing port", url.to_string()))?;
        let key = RouteKey {
            scheme: url.scheme().to_owned(),
            host: host.trim_start_matches('[').trim_end_matches(']').to_owned(),
            port,
            proxy: proxy
                .as_ref()
                .map(|p| format!("{}://{}:{}", p.scheme, p.host, p.port)),
        };
        Ok(Self { key, proxy })
    }

    pub(crate) fn is_tls(&self) -> bool {
        self.key.scheme == "https"
    }
}

/// Point-in-time pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Configured total cap
    pub max: usize,
    /// Connections currently lent to requests
    pub leased: usize,
    /// Callers waiting for a slot
    pub pending: usize,
    /// Idle connections ready for reuse
    pub available: usize,
}

struct IdleConn {
    conn: Connection,
    idle_since: Instant,
    expires: Option<Instant>,
}

impl IdleConn {
    fn is_usable(&self, now: Instant, stale_check: bool) -> bool {
        if self.expires.is_some_and(|at| at <= now) {
            return false;
        }
        // Without the check a half-closed connection is handed out and the
        // send fails before any response byte, which the retry layer replays.
        !stale_check || (!self.conn.is_closed() && self.conn.is_ready())
    }
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<RouteKey, VecDeque<IdleConn>>,
    leased_per_route: HashMap<RouteKey, usize>,
    leased: usize,
    idle_total: usize,
    pending: usize,
}

impl PoolState {
    fn route_total(&self, key: &RouteKey) -> usize {
        self.leased_per_route.get(key).copied().unwrap_or(0)
            + self.idle.get(key).map_or(0, VecDeque::len)
    }

    fn pop_idle(&mut self, key: &RouteKey, now: Instant, stale_check: bool) -> Option<Connection> {
        let queue = self.idle.get_mut(key)?;
        let mut found = None;
        while let Some(idle) = queue.pop_back() {
            self.idle_total -= 1;
            if idle.is_usable(now, stale_check) {
                found = Some(idle.conn);
                break;
            }
            tracing::trace!(route = %key, "discarding unusable idle connection");
        }
        if queue.is_empty() {
            self.idle.remove(key);
        }
        found
    }

    /// Close the least recently used idle connection of another route
    fn evict_lru(&mut self, except: &RouteKey) -> bool {
        let victim = self
            .idle
            .iter()
            .filter(|(key, _)| *key != except)
            .filter_map(|(key, queue)| queue.front().map(|idle| (key.clone(), idle.idle_since)))
            .min_by_key(|(_, since)| *since)
            .map(|(key, _)| key);
        let Some(key) = victim else {
            return false;
        };
        if let Some(queue) = self.idle.get_mut(&key) {
            queue.pop_front();
            self.idle_total -= 1;
            if queue.is_empty() {
                self.idle.remove(&key);
            }
        }
        true
    }

    fn lease(&mut self, key: &RouteKey) {
        self.leased += 1;
        *self.leased_per_route.entry(key.clone()).or_insert(0) += 1;
    }

    fn unlease(&mut self, key: &RouteKey) {
        self.leased = self.leased.saturating_sub(1);
        if let Some(count) = self.leased_per_route.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.leased_per_route.remove(key);
            }
        }
    }
}

/// Connection pool bounded in total and per route
pub(crate) struct ConnectionPool {
    state: Mutex<PoolState>,
    notify: Notify,
    max_total: usize,
    max_per_route: usize,
    stale_check: bool,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(max_total: usize, max_per_route: usize, stale_check: bool) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            notify: Notify::new(),
            max_total: max_total.max(1),
            max_per_route: max_per_route.max(1).min(max_total.max(1)),
            stale_check,
            closed: AtomicBool::new(false),
        }
    }

    /// Lease a slot for `route`, waiting up to `timeout` (zero waits forever).
    ///
    /// The lease carries an idle connection when one is available; otherwise
    /// the caller connects and attaches a fresh one.
    ///
    /// # Errors
    /// `Timeout{Request}` when no slot frees up in time, `ClientStopped`
    /// once the pool is closed.
    pub(crate) async fn acquire(self: &Arc<Self>, route: &Route, timeout: Duration) -> Result<Lease, HttpError> {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            {
                let mut state = self.state.lock();
                if self.is_closed() {
                    return Err(HttpError::ClientStopped);
                }

                let now = Instant::now();
                if let Some(conn) = state.pop_idle(&route.key, now, self.stale_check) {
                    state.lease(&route.key);
                    tracing::trace!(route = %route.key, "reusing pooled connection");
                    return Ok(Lease::new(Arc::clone(self), route.key.clone(), Some(conn)));
                }

                let total = state.leased + state.idle_total;
                let route_total = state.route_total(&route.key);
                if route_total < self.max_per_route
                    && (total < self.max_total || state.evict_lru(&route.key))
                {
                    state.lease(&route.key);
                    return Ok(Lease::new(Arc::clone(self), route.key.clone(), None));
                }

                // Register before unlocking so a release in between is not missed.
                notified.as_mut().enable();
                state.pending += 1;
            }

            tracing::debug!(route = %route.key, "connection pool saturated, waiting");
            let woke = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_ok(),
                None => {
                    notified.await;
                    true
                }
            };
            self.state.lock().pending -= 1;

            if !woke {
                return Err(HttpError::timeout(
                    TimeoutKind::Request,
                    timeout,
                    format!("no pooled connection to {} became available", route.key),
                ));
            }
        }
    }

    fn give_back(&self, key: &RouteKey, conn: Option<Connection>, expires: Option<Instant>) {
        {
            let mut state = self.state.lock();
            state.unlease(key);
            if let Some(conn) = conn
                && !self.is_closed()
            {
                state.idle.entry(key.clone()).or_default().push_back(IdleConn {
                    conn,
                    idle_since: Instant::now(),
                    expires,
                });
                state.idle_total += 1;
            }
        }
        self.notify.notify_waiters();
    }

    /// Close expired and dead idle connections
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        {
            let mut state = self.state.lock();
            for queue in state.idle.values_mut() {
                let before = queue.len();
                queue.retain(|idle| !idle.expires.is_some_and(|at| at <= now) && !idle.conn.is_closed());
                removed += before - queue.len();
            }
            state.idle.retain(|_, queue| !queue.is_empty());
            state.idle_total -= removed;
        }
        if removed > 0 {
            tracing::debug!(removed, "swept idle connections");
            self.notify.notify_waiters();
        }
        removed
    }

    /// Drop every idle connection and fail current and future waiters
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            state.idle.clear();
            state.idle_total = 0;
        }
        self.notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            max: self.max_total,
            leased: state.leased,
            pending: state.pending,
            available: state.idle_total,
        }
    }
}

/// A leased pool slot, optionally carrying a connection
pub(crate) struct Lease {
    pool: Arc<ConnectionPool>,
    key: RouteKey,
    conn: Option<Connection>,
    reusable: bool,
    expires: Option<Instant>,
    complete: bool,
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, key: RouteKey, conn: Option<Connection>) -> Self {
        Self {
            pool,
            key,
            conn,
            reusable: false,
            expires: None,
            complete: false,
        }
    }

    pub(crate) fn is_reused(&self) -> bool {
        self.conn.is_some()
    }

    pub(crate) fn take_connection(&mut self) -> Option<Connection> {
        self.conn.take()
    }

    pub(crate) fn attach(&mut self, conn: Connection) {
        self.conn = Some(conn);
    }

    pub(crate) fn connection(&mut self) -> Option<&mut Connection> {
        self.conn.as_mut()
    }

    /// Allow the connection back into the pool, idle at most until `expires`
    pub(crate) fn allow_reuse(&mut self, expires: Option<Instant>) {
        self.reusable = true;
        self.expires = expires;
    }

    /// The exchange finished cleanly; the connection may be pooled
    pub(crate) fn release(mut self) {
        self.complete = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let conn = self.conn.take().filter(|_| self.complete && self.reusable);
        self.pool.give_back(&self.key, conn, self.expires);
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("route", &self.key)
            .field("has_connection", &self.conn.is_some())
            .field("reusable", &self.reusable)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn route(host: &str) -> Route {
        Route::for_url(&Url::parse(&format!("http://{host}/")).unwrap(), None).unwrap()
    }

    #[test]
    fn test_route_key_from_url() {
        let r = Route::for_url(&Url::parse("https://[::1]:8443/x").unwrap(), None).unwrap();
        assert_eq!(r.key.host, "::1");
        assert_eq!(r.key.port, 8443);
        assert!(r.is_tls());

        let proxy = Arc::new(ProxyConfig::new("proxy.local", 3128));
        let r = Route::for_url(&Url::parse("http://a.test/").unwrap(), Some(proxy)).unwrap();
        assert_eq!(r.key.port, 80);
        assert_eq!(r.key.proxy.as_deref(), Some("http://proxy.local:3128"));
        assert_ne!(r.key, route("a.test").key);
    }

    #[tokio::test]
    async fn test_slots_are_bounded_and_released() {
        let pool = Arc::new(ConnectionPool::new(2, 2, false));
        let a = pool.acquire(&route("a.test"), Duration::from_secs(1)).await.unwrap();
        let b = pool.acquire(&route("a.test"), Duration::from_secs(1)).await.unwrap();
        assert!(!a.is_reused());
        assert_eq!(pool.stats().leased, 2);

        let err = pool
            .acquire(&route("a.test"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.timeout_kind(), Some(TimeoutKind::Request));

        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.leased, 0);
        assert_eq!(stats.available, 0, "leases without a connection leave nothing idle");
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_per_route_cap() {
        let pool = Arc::new(ConnectionPool::new(4, 1, false));
        let _a = pool.acquire(&route("a.test"), Duration::from_secs(1)).await.unwrap();
        assert!(pool.acquire(&route("a.test"), Duration::from_millis(20)).await.is_err());
        assert!(pool.acquire(&route("b.test"), Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn test_waiter_wakes_on_release() {
        let pool = Arc::new(ConnectionPool::new(1, 1, false));
        let held = pool.acquire(&route("a.test"), Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&route("a.test"), Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.stats().pending, 1);

        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_fails_waiters_and_new_leases() {
        let pool = Arc::new(ConnectionPool::new(1, 1, false));
        let _held = pool.acquire(&route("a.test"), Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(&route("a.test"), Duration::ZERO).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.close();

        assert!(matches!(waiter.await.unwrap(), Err(HttpError::ClientStopped)));
        assert!(matches!(
            pool.acquire(&route("b.test"), Duration::from_secs(1)).await,
            Err(HttpError::ClientStopped)
        ));
    }

    #[test]
    fn test_stats_serialize() {
        let pool = ConnectionPool::new(10, 5, true);
        let json = serde_json::to_value(pool.stats()).unwrap();
        assert_eq!(json, serde_json::json!({"max": 10, "leased": 0, "pending": 0, "available": 0}));
    }
}
