use std::path::PathBuf;
use std::time::Duration;

use super::RestartReentry;

/// Per-request options snapshot, also the unit of per-group configuration.
///
/// A group keeps the merged options of the most recent request it served;
/// per-request fields (`sticky_session_id`, `noop`) are never merged into the
/// group.
#[derive(Debug, Clone)]
pub struct Options {
    /// Key of the group this request belongs to: one application root plus
    /// environment.
    pub app_group_name: String,
    /// Filesystem root of the application, handed to the spawner.
    pub app_root: String,
    /// Deployment environment name, e.g. `production`.
    pub environment: String,

    /// Keep at least this many processes around for this group.
    pub min_processes: usize,
    /// Never exceed this many processes for this group. 0 means no
    /// group-level bound (the pool-wide `max` still applies).
    pub max_processes: usize,
    /// Detach a process after it has served this many requests. 0 disables.
    pub max_requests: u64,
    /// Maximum number of queued get-waiters per group. 0 means unbounded.
    pub max_request_queue_size: usize,
    /// How long a get-waiter may sit in the queue before it is answered with
    /// `RequestQueueFull`.
    pub max_request_queue_time: Duration,
    /// Upper bound on concurrent out-of-band-work cycles in this group.
    pub max_out_of_band_work_instances: usize,

    /// Whether restarts drain the old generation (rolling) instead of
    /// killing it (blocking).
    pub rolling_restart: bool,
    /// Behavior of a restart request that arrives while a restart is
    /// already in progress.
    pub restart_reentry: RestartReentry,
    /// Path whose mtime change requests a restart (conventionally
    /// `tmp/restart.txt` under the app root).
    pub restart_file: Option<PathBuf>,

    /// Shared secret the controller sends in the session-protocol envelope.
    pub connect_password: Option<String>,
    /// Key authorizing administrative operations against this group.
    pub api_key: Option<String>,
    /// Uid that owns this group; grants administrative access.
    pub owner_uid: Option<u32>,

    /// Sticky routing target for this request, if the client carried one.
    pub sticky_session_id: Option<u32>,
    /// When set, `get` answers with a dummy session and touches nothing.
    pub noop: bool,
}

impl Options {
    pub fn new<T: Into<String>>(app_group_name: T) -> Self {
        let app_group_name = app_group_name.into();
        Self {
            app_root: format!("/var/www/{}", app_group_name),
            app_group_name,
            environment: "production".to_string(),
            min_processes: 1,
            max_processes: 0,
            max_requests: 0,
            max_request_queue_size: 100,
            max_request_queue_time: Duration::from_secs(30),
            max_out_of_band_work_instances: 1,
            rolling_restart: false,
            restart_reentry: RestartReentry::default(),
            restart_file: None,
            connect_password: None,
            api_key: None,
            owner_uid: None,
            sticky_session_id: None,
            noop: false,
        }
    }

    pub fn app_root<T: Into<String>>(mut self, root: T) -> Self {
        self.app_root = root.into();
        self
    }

    pub fn min_processes(mut self, n: usize) -> Self {
        self.min_processes = n;
        self
    }

    pub fn max_processes(mut self, n: usize) -> Self {
        self.max_processes = n;
        self
    }

    pub fn max_requests(mut self, n: u64) -> Self {
        self.max_requests = n;
        self
    }

    pub fn max_request_queue_size(mut self, n: usize) -> Self {
        self.max_request_queue_size = n;
        self
    }

    pub fn max_request_queue_time(mut self, t: Duration) -> Self {
        self.max_request_queue_time = t;
        self
    }

    pub fn rolling_restart(mut self, on: bool) -> Self {
        self.rolling_restart = on;
        self
    }

    pub fn restart_file<T: Into<PathBuf>>(mut self, path: T) -> Self {
        self.restart_file = Some(path.into());
        self
    }

    pub fn sticky_session_id(mut self, id: Option<u32>) -> Self {
        self.sticky_session_id = id;
        self
    }

    pub fn noop(mut self, noop: bool) -> Self {
        self.noop = noop;
        self
    }

    /// Merges the configuration carried by a newer request into this
    /// (group-held) snapshot. Per-request fields are deliberately skipped.
    pub fn merge(&mut self, newer: &Options) {
        self.app_root = newer.app_root.clone();
        self.environment = newer.environment.clone();
        self.min_processes = newer.min_processes;
        self.max_processes = newer.max_processes;
        self.max_requests = newer.max_requests;
        self.max_request_queue_size = newer.max_request_queue_size;
        self.max_request_queue_time = newer.max_request_queue_time;
        self.max_out_of_band_work_instances = newer.max_out_of_band_work_instances;
        self.rolling_restart = newer.rolling_restart;
        self.restart_reentry = newer.restart_reentry;
        self.restart_file = newer.restart_file.clone();
        self.connect_password = newer.connect_password.clone();
        self.api_key = newer.api_key.clone();
        self.owner_uid = newer.owner_uid;
    }
}

/// Credentials for administrative operations such as detaching a process.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    pub uid: Option<u32>,
    pub api_key: Option<String>,
}
