//! The Application Pool: a process-level scheduler owning a dynamic fleet of
//! application worker processes, grouped by application identity.

pub mod error;
pub mod group;
pub mod options;
pub mod pool;
pub mod process;
pub mod session;
pub mod socket;
pub mod spawner;

pub use error::GetError;
pub use options::{AuthOptions, Options};
pub use pool::{Pool, PoolConfig};
pub use process::Process;
pub use session::Session;
pub use socket::SocketProtocol;
pub use spawner::{DummySpawner, SpawnError, SpawnedProcess, SpawnedSocket, Spawner};

/// A deferred action collected while the pool mutex is held and run strictly
/// after it is released. Every callback the pool invokes may re-enter the
/// pool, so nothing user-visible runs under the lock.
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// Channel end through which a `get` waiter is answered, exactly once.
pub type GetCallback = tokio::sync::oneshot::Sender<Result<Session, GetError>>;

/// Callback invoked when a disable request completes.
pub type DisableCallback = Box<dyn FnOnce(DisableResult) + Send + 'static>;

/// The result of a spawn request on a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnResult {
    /// One process is now being spawned.
    Ok,
    /// A previous spawn request is still in progress; this one was folded
    /// into it.
    InProgress,
    /// A non-rolling restart is in progress, so the request cannot be
    /// honored.
    ErrRestarting,
    /// The group's own upper process limit has been reached. This is checked
    /// before pool capacity.
    ErrGroupUpperLimitsReached,
    /// The pool is at full capacity. Guaranteed to mean the group limit was
    /// not the obstacle.
    ErrPoolAtFullCapacity,
}

/// The result of a disable request on a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableResult {
    /// The process is now disabled.
    Success,
    /// Disabling was canceled before completion (e.g. the process was
    /// detached first).
    Canceled,
    /// The process does not exist or was already disabled.
    Noop,
    /// Disabling cannot complete immediately; the callback fires later.
    Deferred,
}

/// Which restart mode a restart request uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartMethod {
    /// Use the group's configured `rolling_restart` option.
    Default,
    /// Kill every process now; queue requests until the new generation is up.
    Blocking,
    /// Drain the old generation while the new one spawns.
    Rolling,
}

/// What a restart request does when a restart is already in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartReentry {
    /// The newer request supersedes: a fresh generation starts immediately
    /// and everything spawned for the superseded restart drains with the old
    /// generation.
    #[default]
    Supersede,
    /// The newer request is a no-op while a restart is in progress.
    Ignore,
}

/// A queued `get` request awaiting a session.
pub struct GetWaiter {
    pub id: u64,
    pub options: Options,
    pub callback: GetCallback,
}

pub(crate) fn run_post_lock_actions(actions: Vec<Callback>) {
    for action in actions {
        action();
    }
}
