//! Connection pool keyed by scheme, host, port and trust.
//!
//! # Design
//! All bookkeeping lives behind one `Mutex<PoolState>`; no socket I/O happens
//! while it is held except closing connections that were already taken out
//! of the idle lists. A caller that finds no idle connection reserves a slot
//! (so the per-key and global limits count it) and connects after releasing
//! the lock. A caller that finds every slot taken waits on a `Condvar` until
//! a connection is returned or its acquire timeout passes.
//!
//! Idle connections are reused most-recently-returned first. Ones idle for
//! longer than `max_idle` are closed on the next acquire, as are ones whose
//! peer has closed or sent unsolicited bytes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use url::{Host, Url};

use crate::connection::Connection;
use crate::error::RequestError;
use crate::tls::{TrustId, TrustMode};
use crate::types::Scheme;

/// Identity of reusable connections: two requests share sockets only when
/// their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    scheme: Scheme,
    host: String,
    port: u16,
    trust: TrustId,
}

impl PoolKey {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16, trust: TrustId) -> Self {
        PoolKey {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
            trust,
        }
    }

    /// Key for `url`. Plain http ignores the trust mode.
    pub fn from_url(url: &Url, trust: &TrustMode) -> Result<Self, RequestError> {
        let invalid = |reason: &str| RequestError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };
        let scheme = Scheme::parse(url.scheme()).ok_or_else(|| invalid("unsupported scheme"))?;
        let host = match url.host() {
            Some(Host::Domain(d)) => d.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            None => return Err(invalid("missing host")),
        };
        let port = url.port().unwrap_or_else(|| scheme.default_port());
        let trust = match scheme {
            Scheme::Http => TrustId::Platform,
            Scheme::Https => trust.id(),
        };
        Ok(PoolKey::new(scheme, host, port, trust))
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn trust(&self) -> TrustId {
        self.trust
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme, self.host, self.port)?;
        } else {
            write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        }
        if self.trust != TrustId::Platform {
            write!(f, " ({})", self.trust)?;
        }
        Ok(())
    }
}

/// Pool limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_per_key: usize,
    pub max_total: usize,
    pub max_idle: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_per_key: 20,
            max_total: 100,
            max_idle: Duration::from_secs(90),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub leased: usize,
    /// Highest `open` ever observed.
    pub high_water: usize,
}

struct IdleEntry {
    since: Instant,
    conn: Connection,
}

#[derive(Default)]
struct PoolState {
    idle: HashMap<PoolKey, VecDeque<IdleEntry>>,
    open: HashMap<PoolKey, usize>,
    total: usize,
    high_water: usize,
}

impl PoolState {
    fn open_for(&self, key: &PoolKey) -> usize {
        self.open.get(key).copied().unwrap_or(0)
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn reserve(&mut self, key: &PoolKey) {
        *self.open.entry(key.clone()).or_insert(0) += 1;
        self.total += 1;
        self.high_water = self.high_water.max(self.total);
    }

    fn forget(&mut self, key: &PoolKey) {
        if let Some(count) = self.open.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open.remove(key);
            }
            self.total = self.total.saturating_sub(1);
        }
    }

    fn pop_idle(&mut self, key: &PoolKey) -> Option<IdleEntry> {
        let queue = self.idle.get_mut(key)?;
        let entry = queue.pop_back();
        if queue.is_empty() {
            self.idle.remove(key);
        }
        entry
    }

    fn evict_expired(&mut self, max_idle: Duration, out: &mut Vec<Connection>) {
        let mut expired = Vec::new();
        for queue in self.idle.values_mut() {
            while queue.front().is_some_and(|e| e.since.elapsed() >= max_idle) {
                if let Some(entry) = queue.pop_front() {
                    expired.push(entry.conn);
                }
            }
        }
        self.idle.retain(|_, q| !q.is_empty());
        for conn in expired {
            self.forget(conn.key());
            out.push(conn);
        }
    }

    fn evict_oldest_idle(&mut self) -> Option<Connection> {
        let key = self
            .idle
            .iter()
            .filter_map(|(k, q)| q.front().map(|e| (k, e.since)))
            .min_by_key(|(_, since)| *since)
            .map(|(k, _)| k.clone())?;
        let queue = self.idle.get_mut(&key)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.idle.remove(&key);
        }
        let entry = entry?;
        self.forget(&key);
        Some(entry.conn)
    }
}

fn close_all(conns: Vec<Connection>) {
    for conn in conns {
        conn.close();
    }
}

/// Thread-safe pool of idle connections with per-key and global limits.
pub struct ConnectionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    returned: Condvar,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        ConnectionPool {
            config,
            state: Mutex::new(PoolState::default()),
            returned: Condvar::new(),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease a connection for `key`, reusing a healthy idle one when
    /// possible and calling `open` otherwise.
    pub fn acquire<F>(self: &Arc<Self>, key: &PoolKey, open: F) -> Result<Lease, RequestError>
    where
        F: FnOnce() -> Result<Connection, RequestError>,
    {
        let deadline = Instant::now() + self.config.acquire_timeout;
        let mut to_close = Vec::new();
        let mut state = self.lock();
        loop {
            state.evict_expired(self.config.max_idle, &mut to_close);

            while let Some(mut entry) = state.pop_idle(key) {
                if entry.conn.is_idle_healthy() {
                    drop(state);
                    close_all(to_close);
                    trace!(key = %key, conn = entry.conn.id(), "reusing idle connection");
                    return Ok(Lease::new(Arc::clone(self), entry.conn));
                }
                trace!(key = %key, conn = entry.conn.id(), "dropping stale idle connection");
                state.forget(key);
                to_close.push(entry.conn);
            }

            if state.open_for(key) < self.config.max_per_key {
                if state.total >= self.config.max_total {
                    if let Some(victim) = state.evict_oldest_idle() {
                        to_close.push(victim);
                    }
                }
                if state.total < self.config.max_total {
                    state.reserve(key);
                    drop(state);
                    close_all(to_close);
                    return match open() {
                        Ok(conn) => Ok(Lease::new(Arc::clone(self), conn)),
                        Err(e) => {
                            self.lock().forget(key);
                            self.returned.notify_all();
                            Err(e)
                        }
                    };
                }
            }

            if !to_close.is_empty() {
                drop(state);
                close_all(std::mem::take(&mut to_close));
                state = self.lock();
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(key = %key, waited = ?self.config.acquire_timeout, "pool exhausted");
                return Err(RequestError::PoolExhausted {
                    key: key.to_string(),
                    waited: self.config.acquire_timeout,
                });
            }
            let (guard, _) = self
                .returned
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Return a leased connection. Non-reusable connections are closed and
    /// free their slot.
    pub(crate) fn release(&self, conn: Connection, reusable: bool) {
        let mut state = self.lock();
        if reusable {
            trace!(key = %conn.key(), conn = conn.id(), "connection returned to pool");
            state
                .idle
                .entry(conn.key().clone())
                .or_default()
                .push_back(IdleEntry {
                    since: Instant::now(),
                    conn,
                });
            drop(state);
        } else {
            state.forget(conn.key());
            drop(state);
            conn.close();
        }
        self.returned.notify_all();
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        let idle = state.idle_count();
        PoolStats {
            open: state.total,
            idle,
            leased: state.total.saturating_sub(idle),
            high_water: state.high_water,
        }
    }

    /// Connections currently open (idle or leased) for `key`.
    pub fn open_for(&self, key: &PoolKey) -> usize {
        self.lock().open_for(key)
    }

    /// Close every idle connection.
    pub fn clear(&self) {
        let mut state = self.lock();
        let drained: Vec<Connection> = state
            .idle
            .drain()
            .flat_map(|(_, q)| q.into_iter().map(|e| e.conn))
            .collect();
        for conn in &drained {
            state.forget(conn.key());
        }
        drop(state);
        close_all(drained);
        self.returned.notify_all();
    }
}

/// Exclusive use of one pooled connection. Dropping a lease without
/// releasing it closes the connection.
pub struct Lease {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
}

impl Lease {
    fn new(pool: Arc<ConnectionPool>, conn: Connection) -> Self {
        Lease {
            pool,
            conn: Some(conn),
        }
    }

    pub fn connection(&mut self) -> &mut Connection {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection is only taken by release or drop"),
        }
    }

    pub fn release(mut self, reusable: bool) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, reusable);
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            trace!(key = %conn.key(), conn = conn.id(), "discarding unreleased connection");
            self.pool.release(conn, false);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease").field("conn", &self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timeouts;
    use std::net::TcpListener;
    use std::thread;

    fn listener() -> (TcpListener, PoolKey) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, PoolKey::new(Scheme::Http, "127.0.0.1", port, TrustId::Platform))
    }

    fn open(key: &PoolKey) -> impl FnOnce() -> Result<Connection, RequestError> + '_ {
        move || Connection::open(key, &Timeouts::default(), None)
    }

    fn pool(config: PoolConfig) -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::new(config))
    }

    #[test]
    fn released_connection_is_reused() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig::default());

        let mut lease = pool.acquire(&key, open(&key)).unwrap();
        let first = lease.connection().id();
        lease.release(true);

        let mut lease = pool.acquire(&key, open(&key)).unwrap();
        assert_eq!(lease.connection().id(), first);
        assert_eq!(pool.stats().open, 1);
        assert_eq!(pool.stats().leased, 1);
    }

    #[test]
    fn non_reusable_release_frees_the_slot() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig::default());
        pool.acquire(&key, open(&key)).unwrap().release(false);
        assert_eq!(pool.open_for(&key), 0);

        drop(pool.acquire(&key, open(&key)).unwrap());
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn per_key_limit_times_out() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig {
            max_per_key: 1,
            acquire_timeout: Duration::from_millis(50),
            ..PoolConfig::default()
        });
        let _held = pool.acquire(&key, open(&key)).unwrap();
        let err = pool.acquire(&key, open(&key)).unwrap_err();
        assert!(matches!(err, RequestError::PoolExhausted { .. }));
    }

    #[test]
    fn waiter_gets_released_connection() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig {
            max_per_key: 1,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        });
        let mut held = pool.acquire(&key, open(&key)).unwrap();
        let id = held.connection().id();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            held.release(true);
        });
        let mut lease = pool.acquire(&key, open(&key)).unwrap();
        releaser.join().unwrap();
        assert_eq!(lease.connection().id(), id);
        assert_eq!(pool.stats().high_water, 1);
    }

    #[test]
    fn expired_idle_connections_are_closed() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig {
            max_idle: Duration::from_millis(10),
            ..PoolConfig::default()
        });
        let mut lease = pool.acquire(&key, open(&key)).unwrap();
        let first = lease.connection().id();
        lease.release(true);
        thread::sleep(Duration::from_millis(30));

        let mut lease = pool.acquire(&key, open(&key)).unwrap();
        assert_ne!(lease.connection().id(), first);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn failed_open_releases_reservation() {
        let (_l, key) = listener();
        let pool = pool(PoolConfig::default());
        let err = pool
            .acquire(&key, || {
                Err(RequestError::ConnectFailed {
                    key: "x".to_string(),
                    source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
                })
            })
            .unwrap_err();
        assert!(matches!(err, RequestError::ConnectFailed { .. }));
        assert_eq!(pool.open_for(&key), 0);
    }

    #[test]
    fn global_limit_evicts_idle_of_other_key() {
        let (_a, key_a) = listener();
        let (_b, key_b) = listener();
        let pool = pool(PoolConfig {
            max_total: 1,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        });
        pool.acquire(&key_a, open(&key_a)).unwrap().release(true);
        let _b_lease = pool.acquire(&key_b, open(&key_b)).unwrap();
        assert_eq!(pool.open_for(&key_a), 0);
        assert_eq!(pool.open_for(&key_b), 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn keys_differ_by_trust() {
        let url = Url::parse("https://example.com/").unwrap();
        let platform = PoolKey::from_url(&url, &TrustMode::Platform).unwrap();
        let insecure = PoolKey::from_url(&url, &TrustMode::Insecure).unwrap();
        assert_ne!(platform, insecure);
        assert_eq!(platform.port(), 443);
        assert_eq!(platform.to_string(), "https://example.com:443");
        assert_eq!(insecure.to_string(), "https://example.com:443 (insecure)");

        let plain = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(
            PoolKey::from_url(&plain, &TrustMode::Insecure).unwrap().trust(),
            TrustId::Platform
        );
    }
}
