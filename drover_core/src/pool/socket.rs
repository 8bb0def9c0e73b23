//! A worker process's listening endpoint plus its keep-alive connection pool.
//!
//! Session bookkeeping (`sessions`, busyness) is mutated only under the
//! pool's global mutex. The idle-connection list has its own lock because
//! connections are checked in and out from controller tasks that must never
//! touch the pool mutex across I/O.

use std::fmt;

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

use crate::connection::{AddressSpec, Connection, Result as ConnResult};

/// How the worker behind a socket frames requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketProtocol {
    /// Length-prefixed key/value envelope; end-of-request is shutdown(WR).
    Session,
    /// Full HTTP/1.x framing.
    Http,
}

impl SocketProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketProtocol::Session => "session",
            SocketProtocol::Http => "http",
        }
    }
}

impl fmt::Display for SocketProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Shared keep-alive connection pool for one worker endpoint.
///
/// Held through an `Arc` by both the pool-side [`Socket`] and every live
/// session on it, so a connection checked out before the process was
/// detached can still be checked back in (and then closed, since nothing
/// else holds the pool).
pub struct ConnectionPool {
    address: AddressSpec,
    /// Upper bound on retained idle connections; the socket's concurrency.
    limit: usize,
    idle: Mutex<Vec<Connection>>,
}

impl ConnectionPool {
    pub fn new(address: AddressSpec, limit: usize) -> Self {
        Self {
            address,
            limit,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub fn address(&self) -> &AddressSpec {
        &self.address
    }

    /// Reuses an idle connection or opens a new one.
    ///
    /// The caller MUST hand the connection back through
    /// [`ConnectionPool::checkin`]; failing to do so leaks a descriptor.
    pub async fn checkout(&self, purpose: &str) -> ConnResult<Connection> {
        if let Some(conn) = self.idle.lock().pop() {
            trace!(address = %self.address, "reusing idle connection");
            return Ok(conn);
        }
        trace!(address = %self.address, "opening new connection");
        self.address.connect(purpose).await
    }

    /// Returns a connection after a request. Connections flagged as failed,
    /// not keep-alive, or in excess of the limit are closed immediately.
    pub fn checkin(&self, conn: Connection, keep_alive: bool, fail: bool) {
        if fail || !keep_alive {
            return; // dropping closes
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.limit {
            return;
        }
        idle.push(conn);
    }

    /// Closes every idle connection.
    pub fn close_all(&self) {
        self.idle.lock().clear();
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}

/// Pool-side view of one listening endpoint of one process.
pub struct Socket {
    pub address: AddressSpec,
    pub protocol: SocketProtocol,
    /// 0 = unlimited concurrency, -1 = unknown.
    pub concurrency: i32,
    /// Invariant: sessions >= 0, and sessions <= concurrency when
    /// concurrency > 0.
    pub sessions: i32,
    conn_pool: Arc<ConnectionPool>,
}

impl Socket {
    pub fn new(address: AddressSpec, protocol: SocketProtocol, concurrency: i32) -> Self {
        let limit = concurrency.max(0) as usize;
        Self {
            conn_pool: Arc::new(ConnectionPool::new(address.clone(), limit)),
            address,
            protocol,
            concurrency,
            sessions: 0,
        }
    }

    pub fn connection_pool(&self) -> Arc<ConnectionPool> {
        self.conn_pool.clone()
    }

    pub fn is_idle(&self) -> bool {
        self.sessions == 0
    }

    pub fn is_totally_busy(&self) -> bool {
        self.concurrency > 0 && self.sessions >= self.concurrency
    }

    /// Busyness ordering key. Sockets with a concurrency limit express their
    /// load as a fraction of `i32::MAX`, so for the same absolute session
    /// count they sort above sockets with unlimited or unknown concurrency.
    pub fn busyness(&self) -> i64 {
        if self.concurrency <= 0 {
            self.sessions as i64
        } else {
            self.sessions as i64 * i32::MAX as i64 / self.concurrency as i64
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn socket(concurrency: i32, sessions: i32) -> Socket {
        let mut s = Socket::new(
            AddressSpec::Tcp("127.0.0.1:0".into()),
            SocketProtocol::Session,
            concurrency,
        );
        s.sessions = sessions;
        s
    }

    #[test]
    fn busyness_prefers_unlimited_sockets() {
        // Same absolute load: the limited socket must sort strictly higher.
        assert!(socket(4, 2).busyness() > socket(0, 2).busyness());
        assert!(socket(-1, 2).busyness() == 2);
    }

    #[test]
    fn totally_busy_requires_a_limit() {
        assert!(socket(2, 2).is_totally_busy());
        assert!(!socket(2, 1).is_totally_busy());
        assert!(!socket(0, 100).is_totally_busy());
    }

    #[tokio::test]
    async fn checkin_respects_fail_and_keep_alive_flags() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = AddressSpec::Tcp(listener.local_addr().unwrap().to_string());
        let pool = ConnectionPool::new(addr, 2);

        let conn = pool.checkout("test").await.unwrap();
        pool.checkin(conn, true, true);
        assert_eq!(pool.idle_count(), 0);

        let conn = pool.checkout("test").await.unwrap();
        pool.checkin(conn, false, false);
        assert_eq!(pool.idle_count(), 0);

        let conn = pool.checkout("test").await.unwrap();
        pool.checkin(conn, true, false);
        assert_eq!(pool.idle_count(), 1);
    }
}
