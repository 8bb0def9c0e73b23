//! A Session represents one in-flight request on one process's socket.

use std::sync::Arc;

use crate::connection::{Connection, Result as ConnResult};

use super::pool::Pool;
use super::socket::{ConnectionPool, SocketProtocol};

/// Handle for one checked-out request slot on a worker process.
///
/// The slot is accounted the moment the pool creates the session; the actual
/// connection to the worker is opened lazily by [`Session::initiate`], off
/// the pool mutex. Dropping a session without an explicit
/// [`Session::close`] counts as a failed request: the connection is not
/// reused and the slot is released.
pub struct Session {
    pool: Option<Arc<Pool>>,
    group_name: String,
    pid: u32,
    gupid: String,
    sticky_session_id: u32,
    socket_index: usize,
    protocol: SocketProtocol,
    conn_pool: Option<Arc<ConnectionPool>>,
    connection: Option<Connection>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(
        pool: Arc<Pool>,
        group_name: String,
        pid: u32,
        gupid: String,
        sticky_session_id: u32,
        socket_index: usize,
        protocol: SocketProtocol,
        conn_pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            pool: Some(pool),
            group_name,
            pid,
            gupid,
            sticky_session_id,
            socket_index,
            protocol,
            conn_pool: Some(conn_pool),
            connection: None,
            closed: false,
        }
    }

    /// A do-nothing session answering `noop` get requests. It holds no slot
    /// and closing it touches nothing.
    pub(crate) fn noop() -> Self {
        Self {
            pool: None,
            group_name: String::new(),
            pid: 0,
            gupid: String::new(),
            sticky_session_id: 0,
            socket_index: 0,
            protocol: SocketProtocol::Session,
            conn_pool: None,
            connection: None,
            closed: false,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.pool.is_none()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn gupid(&self) -> &str {
        &self.gupid
    }

    pub fn sticky_session_id(&self) -> u32 {
        self.sticky_session_id
    }

    pub fn protocol(&self) -> SocketProtocol {
        self.protocol
    }

    /// Opens (or reuses) the connection to the worker. Must be called before
    /// any I/O; called off the pool mutex by design.
    pub async fn initiate(&mut self) -> ConnResult<()> {
        if self.connection.is_some() || self.is_noop() {
            return Ok(());
        }
        let conn_pool = self.conn_pool.as_ref().expect("real session has a pool");
        let purpose = format!("session with app {}", self.pid);
        self.connection = Some(conn_pool.checkout(&purpose).await?);
        Ok(())
    }

    pub fn is_initiated(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    /// Removes the connection from the session, transferring ownership to
    /// the caller. Used by the controller while proxying (and permanently
    /// for upgraded connections, which never go back to the keep-alive
    /// list).
    pub fn take_connection(&mut self) -> Option<Connection> {
        self.connection.take()
    }

    /// Puts a connection taken with [`Session::take_connection`] back, so
    /// closing the session can check it in for reuse.
    pub fn restore_connection(&mut self, conn: Connection) {
        self.connection = Some(conn);
    }

    /// Closes the session: checks the connection back in (honoring the
    /// keep-alive and fail flags) and releases the request slot.
    pub fn close(mut self, keep_alive: bool, fail: bool) {
        self.close_internal(keep_alive, fail);
    }

    /// Reports that connecting to the worker failed. The pool responds by
    /// detaching the process, on the grounds that a worker refusing
    /// connections is beyond salvage.
    pub fn initiate_failed(mut self) {
        self.closed = true;
        self.connection = None;
        if let Some(pool) = self.pool.take() {
            pool.session_initiate_failed(&self.group_name, &self.gupid, self.socket_index);
        }
    }

    fn close_internal(&mut self, keep_alive: bool, fail: bool) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(conn) = self.connection.take() {
            if let Some(conn_pool) = &self.conn_pool {
                conn_pool.checkin(conn, keep_alive, fail);
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.session_closed(&self.group_name, &self.gupid, self.socket_index);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped session is a failed one: never reuse its connection.
        self.close_internal(false, true);
    }
}
