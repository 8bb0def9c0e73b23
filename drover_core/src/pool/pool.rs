//! The Pool owns every Group and enforces global capacity.
//!
//! One mutex (the "syncher") serializes all structural mutation. Nothing
//! user-visible runs while it is held: callbacks, spawn launches and OOBW
//! requests are collected into a post-lock action vector and run after the
//! guard drops. This discipline is what makes re-entrant callbacks safe and
//! it is not optional.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::connection::AddressSpec;
use crate::controller::envelope::SessionEnvelope;
use crate::http::meta::{parse_response_head, ParseLimits};

use super::error::{GetError, SecurityError};
use super::group::{DisableWaiter, Group, ListKind};
use super::options::{AuthOptions, Options};
use super::process::{spawn_output_pump, EnabledStatus, OobwStatus, Process};
use super::session::Session;
use super::socket::{Socket, SocketProtocol};
use super::spawner::{SpawnError, SpawnedProcess, Spawner};
use super::{
    run_post_lock_actions, Callback, DisableResult, GetCallback, GetWaiter, RestartMethod,
    RestartReentry, SpawnResult,
};

const OOBW_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Global process budget across all groups.
    pub max: usize,
    /// Enabled processes idle longer than this are garbage collected.
    pub max_idle_time: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: 6,
            max_idle_time: Duration::from_secs(300),
        }
    }
}

pub struct Pool {
    config: PoolConfig,
    spawner: Arc<dyn Spawner>,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    groups: HashMap<String, Group>,
    /// Requests that could not even be assigned to a group because the pool
    /// was at full capacity. FIFO.
    get_waitlist: VecDeque<GetWaiter>,
    next_waiter_id: u64,
    gupid_prefix: String,
    gupid_seq: u64,
    sticky_seq: u32,
    shutting_down: bool,
}

/// Ticket a blocking `disable_process` caller sleeps on.
struct DisableTicket {
    state: Mutex<Option<DisableResult>>,
    cond: Condvar,
}

impl Pool {
    pub fn new(config: PoolConfig, spawner: Arc<dyn Spawner>) -> Arc<Self> {
        let prefix: u32 = rand::random();
        Arc::new(Self {
            config,
            spawner,
            inner: Mutex::new(PoolInner {
                groups: HashMap::new(),
                get_waitlist: VecDeque::new(),
                next_waiter_id: 1,
                gupid_prefix: format!("{:08x}", prefix),
                gupid_seq: 1,
                sticky_seq: 1,
                shutting_down: false,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Checks out a session for one request.
    ///
    /// Never fails synchronously: if no process can take the request right
    /// now, the caller waits in the group's FIFO until a session closes, a
    /// spawn completes, or the queue timeout elapses.
    pub async fn get(self: &Arc<Self>, options: Options) -> Result<Session, GetError> {
        let queue_time = options.max_request_queue_time;
        let (tx, rx) = oneshot::channel();
        let mut actions = Vec::new();
        let waiter_id;
        {
            let mut inner = self.inner.lock();
            waiter_id = inner.allocate_waiter_id();
            inner.get(self, waiter_id, options, tx, &mut actions);
        }
        run_post_lock_actions(actions);

        match tokio::time::timeout(queue_time, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GetError::ShuttingDown),
            Err(_) => {
                self.cancel_waiter(waiter_id);
                Err(GetError::RequestQueueFull)
            }
        }
    }

    /// Removes a timed-out waiter from whichever queue it sits in.
    fn cancel_waiter(&self, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.get_waitlist.iter().position(|w| w.id == id) {
            inner.get_waitlist.remove(pos);
            return;
        }
        for group in inner.groups.values_mut() {
            if let Some(pos) = group.get_waitlist.iter().position(|w| w.id == id) {
                group.get_waitlist.remove(pos);
                return;
            }
        }
    }

    /// Detaches a process by gupid, with authorization.
    pub fn detach_process(
        self: &Arc<Self>,
        gupid: &str,
        auth: &AuthOptions,
    ) -> Result<bool, SecurityError> {
        let mut actions = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            let Some(group_name) = inner.find_group_of_gupid(gupid) else {
                return Ok(false);
            };
            let group = &inner.groups[&group_name];
            if !authorize(&group.options, auth) {
                return Err(SecurityError);
            }
            let detached = inner.detach_process_unlocked(self, &group_name, gupid, &mut actions);
            inner.verify_invariants(&self.config);
            Ok(detached)
        };
        run_post_lock_actions(actions);
        result
    }

    /// Detaches a process by pid, with authorization.
    pub fn detach_process_by_pid(
        self: &Arc<Self>,
        pid: u32,
        auth: &AuthOptions,
    ) -> Result<bool, SecurityError> {
        let gupid = {
            let inner = self.inner.lock();
            inner.find_gupid_of_pid(pid)
        };
        match gupid {
            Some(gupid) => self.detach_process(&gupid, auth),
            None => Ok(false),
        }
    }

    /// Requests that a process be taken out of rotation.
    ///
    /// Completes synchronously when the process has no active sessions.
    /// Otherwise this call BLOCKS on a condition variable until the group's
    /// session-close glue finishes the disable (or the process dies), so it
    /// must be called off the event loop (`spawn_blocking` from async code).
    pub fn disable_process(self: &Arc<Self>, gupid: &str) -> DisableResult {
        let ticket = Arc::new(DisableTicket {
            state: Mutex::new(None),
            cond: Condvar::new(),
        });
        let ticket2 = ticket.clone();
        let callback: super::DisableCallback = Box::new(move |result| {
            let mut state = ticket2.state.lock();
            *state = Some(result);
            ticket2.cond.notify_one();
        });

        let mut actions = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            inner.disable_process(self, gupid, Some(callback), &mut actions)
        };
        run_post_lock_actions(actions);

        if result != DisableResult::Deferred {
            return result;
        }
        let mut state = ticket.state.lock();
        while state.is_none() {
            ticket.cond.wait(&mut state);
        }
        state.take().unwrap()
    }

    /// Marks a process as wanting out-of-band work and starts a cycle when
    /// concurrency allows.
    pub fn request_oobw(self: &Arc<Self>, gupid: &str) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            if let Some(group_name) = inner.find_group_of_gupid(gupid) {
                let group = inner.groups.get_mut(&group_name).unwrap();
                if let Some((kind, index)) = group.find_process(gupid) {
                    let process = group.process_mut(kind, index);
                    if process.oobw == OobwStatus::NotActive {
                        process.oobw = OobwStatus::Requested;
                    }
                }
                inner.maybe_initiate_oobw(self, &group_name, gupid, &mut actions);
            }
        }
        run_post_lock_actions(actions);
    }

    /// Restarts a group. Returns false when the group does not exist or the
    /// request was ignored per the configured re-entry policy.
    pub fn restart_group(self: &Arc<Self>, name: &str, method: RestartMethod) -> bool {
        let mut actions = Vec::new();
        let restarted = {
            let mut inner = self.inner.lock();
            let restarted = inner.restart_group(self, name, method, &mut actions);
            inner.verify_invariants(&self.config);
            restarted
        };
        run_post_lock_actions(actions);
        restarted
    }

    /// Spawns the periodic idle-process garbage collector.
    pub fn start_idle_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let period = (self.config.max_idle_time / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                pool.collect_idle_processes();
            }
        })
    }

    /// One idle-GC sweep: detaches enabled processes idle longer than
    /// `max_idle_time`, respecting each group's minimum process count.
    pub fn collect_idle_processes(self: &Arc<Self>) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            let mut victims = Vec::new();
            for group in inner.groups.values() {
                let mut removable = group
                    .process_count()
                    .saturating_sub(group.options.min_processes);
                for process in &group.enabled {
                    if removable == 0 {
                        break;
                    }
                    if process.is_idle()
                        && now.duration_since(process.last_used) >= self.config.max_idle_time
                    {
                        victims.push((group.name.clone(), process.gupid.clone()));
                        removable -= 1;
                    }
                }
            }
            for (group_name, gupid) in victims {
                debug!(group = %group_name, gupid = %gupid, "collecting idle process");
                inner.detach_process_unlocked(self, &group_name, &gupid, &mut actions);
            }
            inner.verify_invariants(&self.config);
        }
        run_post_lock_actions(actions);
    }

    /// Stops taking requests, answers every waiter with `ShuttingDown`, and
    /// detaches every process.
    pub fn shutdown(self: &Arc<Self>) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.shutting_down = true;
            while let Some(waiter) = inner.get_waitlist.pop_front() {
                actions.push(Box::new(move || {
                    let _ = waiter.callback.send(Err(GetError::ShuttingDown));
                }) as Callback);
            }
            let names: Vec<String> = inner.groups.keys().cloned().collect();
            for name in names {
                let group = inner.groups.get_mut(&name).unwrap();
                while let Some(waiter) = group.get_waitlist.pop_front() {
                    actions.push(Box::new(move || {
                        let _ = waiter.callback.send(Err(GetError::ShuttingDown));
                    }) as Callback);
                }
                let gupids: Vec<String> = [&group.enabled, &group.disabling, &group.disabled]
                    .into_iter()
                    .flatten()
                    .map(|p| p.gupid.clone())
                    .collect();
                for gupid in gupids {
                    inner.detach_process_core(&name, &gupid, &mut actions);
                }
            }
        }
        run_post_lock_actions(actions);
    }

    pub fn group_count(&self) -> usize {
        self.inner.lock().groups.len()
    }

    /// Per-list process counts of a group, as (enabled, disabling,
    /// disabled). Introspection for the admin surface and tests.
    pub fn group_summary(&self, name: &str) -> Option<(usize, usize, usize)> {
        let inner = self.inner.lock();
        inner
            .groups
            .get(name)
            .map(|g| (g.enabled_count(), g.disabling_count(), g.disabled_count()))
    }

    pub fn alive_process_count(&self) -> usize {
        self.inner.lock().alive_process_count()
    }

    /// Human-readable state dump, served on `/status.txt` and on SIGQUIT.
    pub fn inspect(&self) -> String {
        let inner = self.inner.lock();
        let mut out = format!(
            "----------- Application pool status -----------\n\
             max      = {}\n\
             capacity = {} used / {} max\n\
             waiting on global queue: {}\n\n",
            self.config.max,
            inner.capacity_used(),
            self.config.max,
            inner.get_waitlist.len(),
        );
        let mut names: Vec<&String> = inner.groups.keys().collect();
        names.sort();
        for name in names {
            out.push_str(&inner.groups[name].inspect());
        }
        out
    }

    /// Test hook: assert every structural invariant.
    pub fn verify_invariants(&self) {
        self.inner.lock().verify_invariants(&self.config);
    }

    pub(crate) fn session_closed(self: &Arc<Self>, group_name: &str, gupid: &str, socket_index: usize) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.session_closed(self, group_name, gupid, socket_index, &mut actions);
            inner.verify_invariants(&self.config);
        }
        run_post_lock_actions(actions);
    }

    pub(crate) fn session_initiate_failed(
        self: &Arc<Self>,
        group_name: &str,
        gupid: &str,
        _socket_index: usize,
    ) {
        debug!(group = %group_name, gupid = %gupid,
            "could not initiate a session; detaching process from pool");
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.detach_process_unlocked(self, group_name, gupid, &mut actions);
            inner.verify_invariants(&self.config);
        }
        run_post_lock_actions(actions);
    }

    pub(crate) fn spawn_completed(
        self: &Arc<Self>,
        group_name: &str,
        generation: u64,
        result: Result<SpawnedProcess, SpawnError>,
    ) {
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.spawn_completed(self, group_name, generation, result, &mut actions);
            inner.verify_invariants(&self.config);
        }
        run_post_lock_actions(actions);
    }

    /// Runs one out-of-band-work request against a (now disabled) process.
    fn start_oobw_request(self: &Arc<Self>, group_name: String, gupid: String) {
        let pool = self.clone();
        tokio::spawn(async move {
            let target = {
                let inner = pool.inner.lock();
                inner.groups.get(&group_name).and_then(|group| {
                    group.find_process(&gupid).and_then(|(kind, index)| {
                        let process = &group.list(kind)[index];
                        process
                            .sockets
                            .iter()
                            .find(|s| s.protocol == SocketProtocol::Session)
                            .map(|s| (s.address.clone(), group.options.connect_password.clone()))
                    })
                })
            };
            let Some((address, password)) = target else {
                pool.oobw_finished(&group_name, &gupid, false);
                return;
            };
            let success = tokio::time::timeout(
                OOBW_REQUEST_TIMEOUT,
                perform_oobw_request(&address, password.as_deref()),
            )
            .await
            .unwrap_or(false);
            pool.oobw_finished(&group_name, &gupid, success);
        });
    }

    fn oobw_finished(self: &Arc<Self>, group_name: &str, gupid: &str, success: bool) {
        if success {
            debug!(group = %group_name, gupid = %gupid, "OOBW request finished");
        } else {
            warn!(group = %group_name, gupid = %gupid, "OOBW request failed; re-enabling process");
        }
        let mut actions = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.oobw_finished(self, group_name, gupid, &mut actions);
            inner.verify_invariants(&self.config);
        }
        run_post_lock_actions(actions);
    }
}

async fn perform_oobw_request(address: &AddressSpec, password: Option<&str>) -> bool {
    use tokio::io::{AsyncWriteExt, BufReader};

    let Ok(conn) = address.connect("OOBW request").await else {
        return false;
    };
    let (read_half, mut write_half) = conn.split();
    let mut envelope = SessionEnvelope::new();
    envelope.push("REQUEST_METHOD", "OOBW");
    envelope.push("PATH_INFO", "/");
    if let Some(password) = password {
        envelope.push("DROVER_CONNECT_PASSWORD", password);
    }
    if write_half.write_all(&envelope.encode()).await.is_err() {
        return false;
    }
    if write_half.shutdown().await.is_err() {
        return false;
    }
    let mut reader = BufReader::new(read_half);
    parse_response_head(&mut reader, &ParseLimits::default())
        .await
        .is_ok()
}

fn authorize(options: &Options, auth: &AuthOptions) -> bool {
    if auth.uid == Some(0) {
        return true;
    }
    if let (Some(uid), Some(owner)) = (auth.uid, options.owner_uid) {
        if uid == owner {
            return true;
        }
    }
    if let (Some(key), Some(expected)) = (&auth.api_key, &options.api_key) {
        if key == expected {
            return true;
        }
    }
    false
}

impl PoolInner {
    fn allocate_waiter_id(&mut self) -> u64 {
        let id = self.next_waiter_id;
        self.next_waiter_id += 1;
        id
    }

    fn alive_process_count(&self) -> usize {
        self.groups.values().map(|g| g.process_count()).sum()
    }

    fn capacity_used(&self) -> usize {
        let spawning = self.groups.values().filter(|g| g.spawning).count();
        self.alive_process_count() + spawning
    }

    fn at_full_capacity(&self, config: &PoolConfig) -> bool {
        self.capacity_used() >= config.max
    }

    fn find_group_of_gupid(&self, gupid: &str) -> Option<String> {
        self.groups
            .values()
            .find(|g| g.find_process(gupid).is_some())
            .map(|g| g.name.clone())
    }

    fn find_gupid_of_pid(&self, pid: u32) -> Option<String> {
        for group in self.groups.values() {
            for process in [&group.enabled, &group.disabling, &group.disabled]
                .into_iter()
                .flatten()
            {
                if process.pid == pid {
                    return Some(process.gupid.clone());
                }
            }
        }
        None
    }

    fn get(
        &mut self,
        pool: &Arc<Pool>,
        waiter_id: u64,
        options: Options,
        callback: GetCallback,
        actions: &mut Vec<Callback>,
    ) {
        if self.shutting_down {
            actions.push(Box::new(move || {
                let _ = callback.send(Err(GetError::ShuttingDown));
            }));
            return;
        }

        let name = options.app_group_name.clone();
        if !self.groups.contains_key(&name) {
            if self.at_full_capacity(&pool.config) {
                // Try to make room before giving up and queueing globally.
                if !self.force_free_capacity(pool, None, actions)
                    && self.at_full_capacity(&pool.config)
                {
                    debug!(group = %name, "pool at full capacity; queueing on global waitlist");
                    self.get_waitlist.push_back(GetWaiter {
                        id: waiter_id,
                        options,
                        callback,
                    });
                    return;
                }
            }
            let group = Group::new(name.clone(), options.clone());
            self.groups.insert(name.clone(), group);
        }

        self.group_get(pool, &name, waiter_id, options, callback, actions);
    }

    fn group_get(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        waiter_id: u64,
        options: Options,
        callback: GetCallback,
        actions: &mut Vec<Callback>,
    ) {
        {
            let group = self.groups.get_mut(name).expect("group exists");
            if group.restarting {
                // Non-rolling restart in progress: queue until the new
                // generation is up.
                Self::push_get_waiter(group, waiter_id, options, callback, actions);
                return;
            }
            group.options.merge(&options);
            if group.needs_restart() {
                self.restart_group(pool, name, RestartMethod::Default, actions);
            }
        }

        if options.noop {
            actions.push(Box::new(move || {
                let _ = callback.send(Ok(Session::noop()));
            }));
            return;
        }

        if self.groups[name].should_spawn_for_get() {
            let result = self.spawn_for_group(pool, name, actions);
            if result == SpawnResult::ErrPoolAtFullCapacity
                && self.groups[name].enabled_count() == 0
            {
                // Trying to spawn the sole process for this group while the
                // pool is full: evict the best idle victim and retry once.
                info!(group = %name,
                    "max pool size reached; shutting down an idle process to free capacity");
                if self.force_free_capacity(pool, Some(name), actions) {
                    let retry = self.spawn_for_group(pool, name, actions);
                    debug_assert_eq!(retry, SpawnResult::Ok);
                } else {
                    info!("no process is eligible for shutdown right now; will try again later");
                }
            }
        }

        let group = self.groups.get_mut(name).expect("group exists");
        if group.restarting {
            Self::push_get_waiter(group, waiter_id, options, callback, actions);
            return;
        }
        match group.route(options.sticky_session_id) {
            Some((kind, index)) => {
                let session = group.checkout_session(pool, kind, index, Instant::now());
                actions.push(Box::new(move || {
                    let _ = callback.send(Ok(session));
                }));
            }
            None => {
                Self::push_get_waiter(group, waiter_id, options, callback, actions);
            }
        }
    }

    fn push_get_waiter(
        group: &mut Group,
        waiter_id: u64,
        options: Options,
        callback: GetCallback,
        actions: &mut Vec<Callback>,
    ) {
        let bound = group.options.max_request_queue_size;
        if bound > 0 && group.get_waitlist.len() >= bound {
            warn!(group = %group.name, queue_size = bound, "request queue is full");
            actions.push(Box::new(move || {
                let _ = callback.send(Err(GetError::RequestQueueFull));
            }));
            return;
        }
        group.get_waitlist.push_back(GetWaiter {
            id: waiter_id,
            options,
            callback,
        });
    }

    fn spawn_for_group(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        actions: &mut Vec<Callback>,
    ) -> SpawnResult {
        if self.groups[name].restarting {
            return SpawnResult::ErrRestarting;
        }
        self.spawn_unchecked(pool, name, actions)
    }

    /// Spawn without the restarting check; the restart driver itself spawns
    /// the new generation while `restarting` is set.
    fn spawn_unchecked(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        actions: &mut Vec<Callback>,
    ) -> SpawnResult {
        let at_capacity = self.at_full_capacity(&pool.config);
        let group = self.groups.get_mut(name).expect("group exists");
        if group.spawning {
            return SpawnResult::InProgress;
        }
        if group.options.max_processes > 0
            && group.process_count() >= group.options.max_processes
        {
            return SpawnResult::ErrGroupUpperLimitsReached;
        }
        if at_capacity {
            return SpawnResult::ErrPoolAtFullCapacity;
        }

        group.spawning = true;
        let options = group.options.clone();
        let generation = group.generation;
        let group_name = group.name.clone();
        let pool = pool.clone();
        debug!(group = %group_name, "spawn requested");
        actions.push(Box::new(move || {
            tokio::spawn(async move {
                let result = pool.spawner.spawn(&options).await;
                pool.spawn_completed(&group_name, generation, result);
            });
        }));
        SpawnResult::Ok
    }

    fn spawn_completed(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        generation: u64,
        result: Result<SpawnedProcess, SpawnError>,
        actions: &mut Vec<Callback>,
    ) {
        let Some(group) = self.groups.get_mut(name) else {
            debug!(group = %name, "spawn completed for a group that no longer exists; discarding");
            return;
        };
        group.spawning = false;

        if generation != group.generation {
            // A restart superseded this spawn; the result is discarded, but
            // the need for a process may remain.
            debug!(group = %name, "spawn result belongs to a superseded generation; discarding");
            if !group.get_waitlist.is_empty() || group.restarting {
                self.spawn_unchecked(pool, name, actions);
            }
            return;
        }

        match result {
            Ok(spawned) => {
                let gupid = format!("{}-{}", self.gupid_prefix, self.gupid_seq);
                self.gupid_seq += 1;
                let sticky = self.sticky_seq;
                self.sticky_seq = self.sticky_seq.wrapping_add(1).max(1);

                let group = self.groups.get_mut(name).unwrap();
                let sockets: Vec<Socket> = spawned
                    .sockets
                    .into_iter()
                    .map(|s| Socket::new(s.address, s.protocol, s.concurrency))
                    .collect();
                let process = Process::new(
                    spawned.pid,
                    gupid.clone(),
                    sticky,
                    group.generation,
                    sockets,
                    SystemTime::now(),
                );
                info!(group = %name, pid = spawned.pid, gupid = %gupid, "process spawned and attached");

                let prefix = format!("[App {}]", spawned.pid);
                if let Some(stdout) = spawned.stdout {
                    let prefix = prefix.clone();
                    actions.push(Box::new(move || spawn_output_pump(stdout, prefix, false)));
                }
                if let Some(stderr) = spawned.stderr {
                    actions.push(Box::new(move || spawn_output_pump(stderr, prefix, true)));
                }

                group.add_process(ListKind::Enabled, process);
                group.restarting = false;

                self.assign_sessions_to_get_waiters(pool, name, actions);

                // Keep spawning while there are more waiters than the new
                // process can take, or the group is below its minimum.
                let group = &self.groups[name];
                if (!group.get_waitlist.is_empty() && group.should_spawn_for_get())
                    || group.should_spawn_for_minimum()
                {
                    self.spawn_for_group(pool, name, actions);
                }
            }
            Err(error) => {
                warn!(group = %name, error = %error, "spawn failed");
                let group = self.groups.get_mut(name).unwrap();
                group.restarting = false;
                let get_error = GetError::SpawnFailed {
                    category: error.category.clone(),
                    summary: error.summary.clone(),
                    details: error.log.clone(),
                };
                while let Some(waiter) = group.get_waitlist.pop_front() {
                    let get_error = get_error.clone();
                    actions.push(Box::new(move || {
                        let _ = waiter.callback.send(Err(get_error));
                    }));
                }
            }
        }
    }

    /// Hands sessions to queued waiters, in FIFO order, while capacity
    /// remains. Runs inline under the pool mutex; only the callback sends
    /// are deferred.
    fn assign_sessions_to_get_waiters(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        actions: &mut Vec<Callback>,
    ) {
        loop {
            let Some(group) = self.groups.get_mut(name) else {
                return;
            };
            let Some(front) = group.get_waitlist.front() else {
                return;
            };
            let sticky = front.options.sticky_session_id;
            match group.route(sticky) {
                Some((kind, index)) => {
                    let waiter = group.get_waitlist.pop_front().unwrap();
                    let session = group.checkout_session(pool, kind, index, Instant::now());
                    actions.push(Box::new(move || {
                        let _ = waiter.callback.send(Ok(session));
                    }));
                }
                None => return,
            }
        }
    }

    /// Re-runs `get` for requests parked on the global waitlist, after
    /// capacity was freed.
    fn assign_pool_waiters(&mut self, pool: &Arc<Pool>, actions: &mut Vec<Callback>) {
        while !self.get_waitlist.is_empty() && !self.at_full_capacity(&pool.config) {
            let waiter = self.get_waitlist.pop_front().unwrap();
            self.get(pool, waiter.id, waiter.options, waiter.callback, actions);
        }
    }

    fn session_closed(
        &mut self,
        pool: &Arc<Pool>,
        group_name: &str,
        gupid: &str,
        socket_index: usize,
        actions: &mut Vec<Callback>,
    ) {
        let pool_has_waiters = !self.get_waitlist.is_empty();
        let another_waiting = self.another_group_is_waiting_for_capacity(group_name);
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        let Some((kind, index)) = group.find_process(gupid) else {
            // Already detached; the connection was dealt with by the session.
            return;
        };

        let now = Instant::now();
        {
            let process = group.process_mut(kind, index);
            let was_totally_busy = process.is_totally_busy();
            process.session_closed(socket_index, now);
            if kind == ListKind::Enabled {
                group.refresh_enabled_stats(index, was_totally_busy);
            }
        }

        let group = self.groups.get_mut(group_name).unwrap();
        let process = &group.list(kind)[index];
        let max_requests = group.options.max_requests;

        let detach_for_max_requests = max_requests > 0 && process.processed >= max_requests;
        let detach_for_capacity = !detach_for_max_requests
            && process.is_idle()
            && group.get_waitlist.is_empty()
            && (pool_has_waiters || another_waiting);

        if detach_for_max_requests {
            debug!(group = %group_name, gupid = %gupid, max_requests,
                "process reached its maximum number of requests; detaching");
            self.detach_process_unlocked(pool, group_name, gupid, actions);
        } else if detach_for_capacity {
            debug!(group = %group_name, gupid = %gupid,
                "process is idle and capacity is needed elsewhere; detaching");
            self.detach_process_unlocked(pool, group_name, gupid, actions);
        } else if kind == ListKind::Disabling && process.is_idle() {
            if process.generation < group.generation && group.enabled_count() > 0 {
                // Old-generation process drained during a rolling restart.
                debug!(group = %group_name, gupid = %gupid,
                    "old-generation process drained; detaching");
                self.detach_process_unlocked(pool, group_name, gupid, actions);
            } else if group.enabled_count() > 0 || process.oobw == OobwStatus::InProgress {
                group.move_process(ListKind::Disabling, index, ListKind::Disabled);
                for callback in group.take_disable_waiters(gupid) {
                    actions.push(Box::new(move || callback(DisableResult::Success)));
                }
                if group.disabled.last().map(|p| p.oobw) == Some(OobwStatus::InProgress) {
                    let pool = pool.clone();
                    let group_name = group_name.to_string();
                    let gupid = gupid.to_string();
                    actions.push(Box::new(move || {
                        pool.start_oobw_request(group_name, gupid);
                    }));
                }
            }
            // With no enabled process and no OOBW pending, the drained
            // disabling process keeps serving until the spawn catches up.
        } else {
            let gupid_owned = gupid.to_string();
            self.maybe_initiate_oobw(pool, group_name, &gupid_owned, actions);
            let group = &self.groups[group_name];
            if !group.get_waitlist.is_empty() {
                if let Some((k, _)) = group.find_process(&gupid_owned) {
                    if k == ListKind::Enabled {
                        self.assign_sessions_to_get_waiters(pool, group_name, actions);
                    }
                }
            }
        }
    }

    fn another_group_is_waiting_for_capacity(&self, exclude: &str) -> bool {
        self.groups
            .values()
            .any(|g| g.name != exclude && g.is_waiting_for_capacity())
    }

    /// Removes a process from its group without any follow-up passes.
    fn detach_process_core(
        &mut self,
        group_name: &str,
        gupid: &str,
        actions: &mut Vec<Callback>,
    ) -> bool {
        let Some(group) = self.groups.get_mut(group_name) else {
            return false;
        };
        let Some((kind, index)) = group.find_process(gupid) else {
            return false;
        };
        let mut process = group.remove_process(kind, index);
        process.enabled = EnabledStatus::Detached;
        for socket in &process.sockets {
            socket.connection_pool().close_all();
        }
        for callback in group.take_disable_waiters(gupid) {
            actions.push(Box::new(move || callback(DisableResult::Canceled)));
        }
        debug!(group = %group_name, gupid = %gupid, "process detached");
        true
    }

    /// Full detach: remove the process, then hand freed capacity to waiters
    /// and to groups that were blocked on it.
    fn detach_process_unlocked(
        &mut self,
        pool: &Arc<Pool>,
        group_name: &str,
        gupid: &str,
        actions: &mut Vec<Callback>,
    ) -> bool {
        if !self.detach_process_core(group_name, gupid, actions) {
            return false;
        }
        self.assign_sessions_to_get_waiters(pool, group_name, actions);
        self.possibly_spawn_more_processes(pool, actions);
        self.assign_pool_waiters(pool, actions);
        true
    }

    /// Chooses the enabled process with zero sessions and the oldest
    /// `last_used`, across every group except `exclude`.
    fn find_oldest_idle_process(&self, exclude: Option<&str>) -> Option<(String, String)> {
        let mut best: Option<(&Process, &str)> = None;
        for group in self.groups.values() {
            if Some(group.name.as_str()) == exclude {
                continue;
            }
            for process in &group.enabled {
                if process.busyness() != 0 {
                    continue;
                }
                match best {
                    Some((b, _)) if b.last_used <= process.last_used => {}
                    _ => best = Some((process, group.name.as_str())),
                }
            }
        }
        best.map(|(p, g)| (g.to_string(), p.gupid.clone()))
    }

    /// Evicts the best idle victim to make room. The victim's group has an
    /// empty waitlist by construction (idle process implies no waiters).
    fn force_free_capacity(
        &mut self,
        _pool: &Arc<Pool>,
        exclude: Option<&str>,
        actions: &mut Vec<Callback>,
    ) -> bool {
        let Some((group_name, gupid)) = self.find_oldest_idle_process(exclude) else {
            return false;
        };
        debug!(group = %group_name, gupid = %gupid,
            "forcefully detaching process to free capacity");
        debug_assert!(self.groups[&group_name].get_waitlist.is_empty());
        self.detach_process_core(&group_name, &gupid, actions)
    }

    /// The cross-group fair-spawn passes: first serve groups with waiting
    /// requests, then groups below their configured minimum.
    fn possibly_spawn_more_processes(&mut self, pool: &Arc<Pool>, actions: &mut Vec<Callback>) {
        let names: Vec<String> = self.groups.keys().cloned().collect();
        for name in &names {
            if self.at_full_capacity(&pool.config) {
                return;
            }
            let group = &self.groups[name];
            if !group.get_waitlist.is_empty() && !group.spawning && !group.restarting {
                debug!(group = %name, "group has waiting requests; spawning");
                self.spawn_for_group(pool, name, actions);
            }
        }
        for name in &names {
            if self.at_full_capacity(&pool.config) {
                return;
            }
            if self.groups[name].should_spawn_for_minimum() {
                debug!(group = %name, "group is below its minimum; spawning");
                self.spawn_for_group(pool, name, actions);
            }
        }
    }

    fn disable_process(
        &mut self,
        pool: &Arc<Pool>,
        gupid: &str,
        callback: Option<super::DisableCallback>,
        actions: &mut Vec<Callback>,
    ) -> DisableResult {
        let Some(group_name) = self.find_group_of_gupid(gupid) else {
            return DisableResult::Noop;
        };
        let group = self.groups.get_mut(&group_name).unwrap();
        let (kind, index) = group.find_process(gupid).unwrap();
        let result = match kind {
            ListKind::Enabled => {
                if group.enabled[index].is_idle() {
                    group.move_process(ListKind::Enabled, index, ListKind::Disabled);
                    DisableResult::Success
                } else {
                    group.move_process(ListKind::Enabled, index, ListKind::Disabling);
                    if let Some(callback) = callback {
                        group.disable_waitlist.push(DisableWaiter {
                            gupid: gupid.to_string(),
                            callback,
                        });
                    }
                    DisableResult::Deferred
                }
            }
            ListKind::Disabling => {
                if let Some(callback) = callback {
                    group.disable_waitlist.push(DisableWaiter {
                        gupid: gupid.to_string(),
                        callback,
                    });
                }
                DisableResult::Deferred
            }
            ListKind::Disabled => DisableResult::Noop,
        };
        // Disabling the last enabled process leaves the group unroutable;
        // spawn a replacement so the disable can complete.
        if result != DisableResult::Noop && self.groups[&group_name].enabled_count() == 0 {
            self.spawn_for_group(pool, &group_name, actions);
        }
        result
    }

    fn maybe_initiate_oobw(
        &mut self,
        pool: &Arc<Pool>,
        group_name: &str,
        gupid: &str,
        actions: &mut Vec<Callback>,
    ) {
        let Some(group) = self.groups.get_mut(group_name) else {
            return;
        };
        let allowed =
            group.oobw_in_progress_count() < group.options.max_out_of_band_work_instances;
        let Some((kind, index)) = group.find_process(gupid) else {
            return;
        };
        if kind != ListKind::Enabled
            || group.enabled[index].oobw != OobwStatus::Requested
            || !allowed
        {
            return;
        }

        debug!(group = %group_name, gupid = %gupid, "initiating out-of-band work");
        group.enabled[index].oobw = OobwStatus::InProgress;
        if group.enabled[index].is_idle() {
            group.move_process(ListKind::Enabled, index, ListKind::Disabled);
            let pool = pool.clone();
            let group_name = group_name.to_string();
            let gupid = gupid.to_string();
            actions.push(Box::new(move || {
                pool.start_oobw_request(group_name, gupid);
            }));
        } else {
            // Drain first; the session-close glue starts the request once
            // the process reaches the disabled list.
            group.move_process(ListKind::Enabled, index, ListKind::Disabling);
        }
    }

    fn oobw_finished(
        &mut self,
        pool: &Arc<Pool>,
        group_name: &str,
        gupid: &str,
        actions: &mut Vec<Callback>,
    ) {
        {
            let Some(group) = self.groups.get_mut(group_name) else {
                return;
            };
            let Some((kind, index)) = group.find_process(gupid) else {
                return;
            };
            match kind {
                ListKind::Disabled => {
                    group.disabled[index].oobw = OobwStatus::NotActive;
                    group.move_process(ListKind::Disabled, index, ListKind::Enabled);
                }
                _ => {
                    // The process moved while the request ran (detach race);
                    // just clear the flag.
                    group.process_mut(kind, index).oobw = OobwStatus::NotActive;
                }
            }
        }
        self.assign_sessions_to_get_waiters(pool, group_name, actions);

        // Another process may have a pending OOBW request.
        let pending: Vec<String> = {
            let group = &self.groups[group_name];
            [&group.enabled, &group.disabling, &group.disabled]
                .into_iter()
                .flatten()
                .filter(|p| p.oobw == OobwStatus::Requested)
                .map(|p| p.gupid.clone())
                .collect()
        };
        for gupid in pending {
            self.maybe_initiate_oobw(pool, group_name, &gupid, actions);
        }
    }

    fn restart_group(
        &mut self,
        pool: &Arc<Pool>,
        name: &str,
        method: RestartMethod,
        actions: &mut Vec<Callback>,
    ) -> bool {
        let Some(group) = self.groups.get_mut(name) else {
            return false;
        };
        let in_progress = group.restarting
            || group.disabling.iter().any(|p| p.generation < group.generation);
        if in_progress && group.options.restart_reentry == RestartReentry::Ignore {
            debug!(group = %name, "restart already in progress; ignoring per configuration");
            return false;
        }

        let rolling = match method {
            RestartMethod::Default => group.options.rolling_restart,
            RestartMethod::Blocking => false,
            RestartMethod::Rolling => true,
        };
        group.generation += 1;
        group.note_restart_file_seen();
        info!(group = %name, rolling, generation = group.generation, "restarting group");

        if rolling {
            // Old generation keeps serving while it drains; it is detached
            // process by process from the session-close glue.
            while !group.enabled.is_empty() {
                group.move_process(ListKind::Enabled, 0, ListKind::Disabling);
            }
            // Already-disabling processes from a superseded restart simply
            // stay where they are; their generation marks them for GC.
            self.spawn_unchecked(pool, name, actions);
        } else {
            let gupids: Vec<String> = [&group.enabled, &group.disabling, &group.disabled]
                .into_iter()
                .flatten()
                .map(|p| p.gupid.clone())
                .collect();
            for gupid in gupids {
                self.detach_process_core(name, &gupid, actions);
            }
            let group = self.groups.get_mut(name).unwrap();
            group.restarting = true;
            // An in-flight spawn for the old generation keeps `spawning`
            // set; its result arrives as superseded and triggers the
            // respawn. Otherwise spawn the new generation now.
            self.spawn_unchecked(pool, name, actions);
        }

        // Drained old-generation disabling processes will never see another
        // session close; collect them now.
        let drained: Vec<String> = {
            let group = &self.groups[name];
            group
                .disabling
                .iter()
                .filter(|p| p.is_idle() && p.generation < group.generation)
                .map(|p| p.gupid.clone())
                .collect()
        };
        for gupid in drained {
            self.detach_process_unlocked(pool, name, &gupid, actions);
        }
        true
    }

    fn verify_invariants(&self, config: &PoolConfig) {
        if cfg!(debug_assertions) {
            for group in self.groups.values() {
                group.verify_invariants();
            }
            assert!(self.alive_process_count() <= config.max);
        }
    }
}
