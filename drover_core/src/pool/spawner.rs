//! The seam between the pool and the subprocess-launch machinery.
//!
//! The pool decides *when* a process must exist; an implementation of
//! [`Spawner`] decides *how* one comes into being. The real launcher lives
//! outside this crate. [`DummySpawner`] stands in for it in tests and
//! development mode: it produces processes pointing at pre-registered
//! addresses (usually in-process listeners) after a configurable delay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncRead;

use crate::connection::AddressSpec;

use super::options::Options;
use super::socket::SocketProtocol;

/// One listening endpoint reported by a freshly spawned process.
pub struct SpawnedSocket {
    pub address: AddressSpec,
    pub protocol: SocketProtocol,
    /// 0 = unlimited, -1 = unknown.
    pub concurrency: i32,
}

/// Output stream of a spawned process, pumped into the log.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Everything the pool needs to know about a process the spawner launched.
pub struct SpawnedProcess {
    pub pid: u32,
    pub sockets: Vec<SpawnedSocket>,
    pub stdout: Option<OutputStream>,
    pub stderr: Option<OutputStream>,
}

#[derive(Debug, Clone, Error)]
#[error("{category}: {summary}")]
pub struct SpawnError {
    /// Stable machine-readable category, e.g. `OPERATING_SYSTEM_ERROR`.
    pub category: String,
    pub summary: String,
    /// Spawn log excerpt for the friendly error page.
    pub log: Option<String>,
}

impl SpawnError {
    pub fn new<C: Into<String>, S: Into<String>>(category: C, summary: S) -> Self {
        Self {
            category: category.into(),
            summary: summary.into(),
            log: None,
        }
    }

    pub fn with_log<T: Into<String>>(mut self, log: T) -> Self {
        self.log = Some(log.into());
        self
    }
}

#[async_trait]
pub trait Spawner: Send + Sync {
    async fn spawn(&self, options: &Options) -> Result<SpawnedProcess, SpawnError>;
}

/// Test and development spawner.
///
/// Addresses queued with [`DummySpawner::push_address`] are consumed in
/// order; once the queue is empty every spawn reuses `fallback_address`.
/// Spawns fail when a failure has been injected with [`DummySpawner::fail_next`].
pub struct DummySpawner {
    pid_counter: AtomicU32,
    concurrency: i32,
    spawn_time: Duration,
    protocol: SocketProtocol,
    fallback_address: AddressSpec,
    addresses: Mutex<VecDeque<AddressSpec>>,
    fail_next: Mutex<Option<SpawnError>>,
}

impl DummySpawner {
    pub fn new(concurrency: i32) -> Self {
        Self {
            pid_counter: AtomicU32::new(1000),
            concurrency,
            spawn_time: Duration::from_millis(0),
            protocol: SocketProtocol::Session,
            fallback_address: AddressSpec::Unix("/tmp/drover-dummy.sock".into()),
            addresses: Mutex::new(VecDeque::new()),
            fail_next: Mutex::new(None),
        }
    }

    pub fn spawn_time(mut self, time: Duration) -> Self {
        self.spawn_time = time;
        self
    }

    pub fn protocol(mut self, protocol: SocketProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn fallback_address(mut self, address: AddressSpec) -> Self {
        self.fallback_address = address;
        self
    }

    /// Queues the address the next spawned process will listen on.
    pub fn push_address(&self, address: AddressSpec) {
        self.addresses.lock().push_back(address);
    }

    /// Makes the next spawn fail with the given error.
    pub fn fail_next(&self, error: SpawnError) {
        *self.fail_next.lock() = Some(error);
    }

    pub fn spawned_count(&self) -> u32 {
        self.pid_counter.load(Ordering::Relaxed) - 1000
    }
}

#[async_trait]
impl Spawner for DummySpawner {
    async fn spawn(&self, _options: &Options) -> Result<SpawnedProcess, SpawnError> {
        if self.spawn_time > Duration::ZERO {
            tokio::time::sleep(self.spawn_time).await;
        }
        if let Some(error) = self.fail_next.lock().take() {
            return Err(error);
        }
        let address = self
            .addresses
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback_address.clone());
        let pid = self.pid_counter.fetch_add(1, Ordering::Relaxed);
        Ok(SpawnedProcess {
            pid,
            sockets: vec![SpawnedSocket {
                address,
                protocol: self.protocol,
                concurrency: self.concurrency,
            }],
            stdout: None,
            stderr: None,
        })
    }
}
