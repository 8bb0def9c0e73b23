//! A Group: all processes running one application (app root + environment),
//! plus the queue of requests waiting for one of them.
//!
//! Groups are plain data owned by the pool and mutated only under the pool's
//! global mutex; everything here is synchronous bookkeeping. Cross-group
//! logic (spawning, capacity, waiter assignment) lives in the pool module.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tracing::debug;

use super::options::Options;
use super::pool::Pool;
use super::process::{EnabledStatus, OobwStatus, Process};
use super::session::Session;
use super::{DisableCallback, GetWaiter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupLifeStatus {
    Alive,
    ShuttingDown,
    ShutDown,
}

/// Which of the group's three process lists a process sits in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Enabled,
    Disabling,
    Disabled,
}

/// A pending disable request, resolved when the target drains or dies.
pub struct DisableWaiter {
    pub gupid: String,
    pub callback: DisableCallback,
}

pub struct Group {
    pub name: String,
    pub options: Options,
    pub life_status: GroupLifeStatus,

    pub enabled: Vec<Process>,
    pub disabling: Vec<Process>,
    pub disabled: Vec<Process>,
    /// Parallel to `enabled`: cached busyness for fast least-busy selection.
    busyness_levels: Vec<i64>,
    /// Number of processes in `enabled` that are totally busy.
    pub n_enabled_totally_busy: usize,

    pub get_waitlist: VecDeque<GetWaiter>,
    pub disable_waitlist: Vec<DisableWaiter>,

    /// A spawn is in flight for this group.
    pub spawning: bool,
    /// A non-rolling restart is in progress: no routing until the new
    /// generation is up.
    pub restarting: bool,
    /// Bumped on every restart; processes and spawn results carry the
    /// generation they belong to, so superseded spawns can be recognized.
    pub generation: u64,
    pub restart_file_mtime: Option<SystemTime>,
}

impl Group {
    pub fn new(name: String, options: Options) -> Self {
        let restart_file_mtime = options
            .restart_file
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok());
        Self {
            name,
            options,
            life_status: GroupLifeStatus::Alive,
            enabled: Vec::new(),
            disabling: Vec::new(),
            disabled: Vec::new(),
            busyness_levels: Vec::new(),
            n_enabled_totally_busy: 0,
            get_waitlist: VecDeque::new(),
            disable_waitlist: Vec::new(),
            spawning: false,
            restarting: false,
            generation: 0,
            restart_file_mtime,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.life_status == GroupLifeStatus::Alive
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    pub fn disabling_count(&self) -> usize {
        self.disabling.len()
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.len()
    }

    pub fn process_count(&self) -> usize {
        self.enabled.len() + self.disabling.len() + self.disabled.len()
    }

    pub fn list(&self, kind: ListKind) -> &Vec<Process> {
        match kind {
            ListKind::Enabled => &self.enabled,
            ListKind::Disabling => &self.disabling,
            ListKind::Disabled => &self.disabled,
        }
    }

    fn list_mut(&mut self, kind: ListKind) -> &mut Vec<Process> {
        match kind {
            ListKind::Enabled => &mut self.enabled,
            ListKind::Disabling => &mut self.disabling,
            ListKind::Disabled => &mut self.disabled,
        }
    }

    pub fn process_mut(&mut self, kind: ListKind, index: usize) -> &mut Process {
        &mut self.list_mut(kind)[index]
    }

    /// Finds a process by gupid across all three lists.
    pub fn find_process(&self, gupid: &str) -> Option<(ListKind, usize)> {
        for kind in [ListKind::Enabled, ListKind::Disabling, ListKind::Disabled] {
            if let Some(i) = self.list(kind).iter().position(|p| p.gupid == gupid) {
                return Some((kind, i));
            }
        }
        None
    }

    fn find_enabled_with_lowest_busyness(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, level) in self.busyness_levels.iter().enumerate() {
            match best {
                Some(b) if self.busyness_levels[b] <= *level => {}
                _ => best = Some(i),
            }
        }
        best
    }

    fn find_disabling_with_lowest_busyness(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, process) in self.disabling.iter().enumerate() {
            match best {
                Some(b) if self.disabling[b].busyness() <= process.busyness() => {}
                _ => best = Some(i),
            }
        }
        best
    }

    /// Determines which process a get() action routes to. The returned
    /// process is guaranteed routable.
    ///
    /// Enabled processes are preferred; with none of those, disabling
    /// processes still serve traffic until the spawn catches up — waiting
    /// for a spawn is more expensive than using an old-generation process.
    pub fn route(&self, sticky_session_id: Option<u32>) -> Option<(ListKind, usize)> {
        if self.enabled_count() > 0 {
            if let Some(id) = sticky_session_id {
                match self.enabled.iter().position(|p| p.sticky_session_id == id) {
                    Some(i) => {
                        // Stickiness is honored or the caller waits; never
                        // silently fall back to a different process.
                        return if self.enabled[i].can_be_routed_to() {
                            Some((ListKind::Enabled, i))
                        } else {
                            None
                        };
                    }
                    None => {}
                }
            }
            let i = self.find_enabled_with_lowest_busyness()?;
            if self.enabled[i].can_be_routed_to() {
                Some((ListKind::Enabled, i))
            } else {
                None
            }
        } else {
            let i = self.find_disabling_with_lowest_busyness()?;
            if self.disabling[i].can_be_routed_to() {
                Some((ListKind::Disabling, i))
            } else {
                None
            }
        }
    }

    /// Checks a session out of the routed process, keeping the busyness
    /// cache and the totally-busy counter in step.
    pub fn checkout_session(
        &mut self,
        pool: &Arc<Pool>,
        kind: ListKind,
        index: usize,
        now: Instant,
    ) -> Session {
        let name = self.name.clone();
        let is_enabled = kind == ListKind::Enabled;
        let process = &mut self.list_mut(kind)[index];
        let was_totally_busy = process.is_totally_busy();
        let socket_index = process
            .new_session(now)
            .expect("routed process must not be totally busy");
        let session = Session::new(
            pool.clone(),
            name,
            process.pid,
            process.gupid.clone(),
            process.sticky_session_id,
            socket_index,
            process.sockets[socket_index].protocol,
            process.sockets[socket_index].connection_pool(),
        );
        if is_enabled {
            self.busyness_levels[index] = self.enabled[index].busyness();
            if !was_totally_busy && self.enabled[index].is_totally_busy() {
                self.n_enabled_totally_busy += 1;
            }
        }
        session
    }

    /// Re-derives the busyness cache entry for one enabled process after a
    /// session close. Returns whether the process stopped being totally
    /// busy.
    pub fn refresh_enabled_stats(&mut self, index: usize, was_totally_busy: bool) {
        self.busyness_levels[index] = self.enabled[index].busyness();
        if was_totally_busy && !self.enabled[index].is_totally_busy() {
            debug_assert!(self.n_enabled_totally_busy > 0);
            self.n_enabled_totally_busy -= 1;
        }
    }

    /// Recomputes the whole busyness cache. Used after list moves, which are
    /// rare next to session churn.
    pub fn rebuild_enabled_stats(&mut self) {
        self.busyness_levels = self.enabled.iter().map(|p| p.busyness()).collect();
        self.n_enabled_totally_busy = self
            .enabled
            .iter()
            .filter(|p| p.is_totally_busy())
            .count();
    }

    /// Pushes a process onto a list with the right status, fixing stats.
    pub fn add_process(&mut self, kind: ListKind, mut process: Process) {
        process.enabled = match kind {
            ListKind::Enabled => EnabledStatus::Enabled,
            ListKind::Disabling => EnabledStatus::Disabling,
            ListKind::Disabled => EnabledStatus::Disabled,
        };
        self.list_mut(kind).push(process);
        if kind == ListKind::Enabled {
            self.rebuild_enabled_stats();
        }
    }

    /// Removes a process from a list, fixing stats.
    pub fn remove_process(&mut self, kind: ListKind, index: usize) -> Process {
        let process = self.list_mut(kind).remove(index);
        if kind == ListKind::Enabled {
            self.rebuild_enabled_stats();
        }
        process
    }

    /// Moves a process between lists, fixing status and stats.
    pub fn move_process(&mut self, from: ListKind, index: usize, to: ListKind) {
        let process = self.remove_process(from, index);
        self.add_process(to, process);
    }

    /// Resolves (and removes) every disable-waiter for `gupid`. The returned
    /// callbacks must be run as post-lock actions.
    pub fn take_disable_waiters(&mut self, gupid: &str) -> Vec<DisableCallback> {
        let mut taken = Vec::new();
        let mut i = 0;
        while i < self.disable_waitlist.len() {
            if self.disable_waitlist[i].gupid == gupid {
                taken.push(self.disable_waitlist.remove(i).callback);
            } else {
                i += 1;
            }
        }
        taken
    }

    /// Whether this group is blocked on pool capacity: it has waiters but no
    /// process and no spawn in flight.
    pub fn is_waiting_for_capacity(&self) -> bool {
        !self.get_waitlist.is_empty() && self.process_count() == 0 && !self.spawning
    }

    /// Whether the group wants another process for steady-state reasons
    /// (below its configured minimum).
    pub fn should_spawn_for_minimum(&self) -> bool {
        !self.restarting && !self.spawning && self.process_count() < self.options.min_processes
    }

    /// Whether serving a get() requires a spawn attempt right now.
    pub fn should_spawn_for_get(&self) -> bool {
        if self.spawning || self.restarting {
            return false;
        }
        if self.process_count() < self.options.min_processes.max(1) {
            return true;
        }
        // All routable processes saturated: spawn ahead of demand.
        self.enabled_count() > 0
            && self.n_enabled_totally_busy == self.enabled_count()
            && self.disabling.iter().all(|p| p.is_totally_busy())
    }

    /// Whether the configured restart file changed since we last looked.
    pub fn needs_restart(&self) -> bool {
        let Some(path) = &self.options.restart_file else {
            return false;
        };
        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        match (mtime, self.restart_file_mtime) {
            (Some(new), Some(old)) => new > old,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn note_restart_file_seen(&mut self) {
        self.restart_file_mtime = self
            .options
            .restart_file
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .and_then(|m| m.modified().ok());
    }

    pub fn oobw_in_progress_count(&self) -> usize {
        [&self.enabled, &self.disabling, &self.disabled]
            .into_iter()
            .flatten()
            .filter(|p| p.oobw == OobwStatus::InProgress)
            .count()
    }

    /// Sanity checks run after mutations in debug builds and from tests.
    pub fn verify_invariants(&self) {
        assert_eq!(self.busyness_levels.len(), self.enabled.len());
        let recount = self
            .enabled
            .iter()
            .filter(|p| p.is_totally_busy())
            .count();
        assert_eq!(self.n_enabled_totally_busy, recount);
        for (process, level) in self.enabled.iter().zip(&self.busyness_levels) {
            assert_eq!(process.busyness(), *level);
            assert_eq!(process.enabled, EnabledStatus::Enabled);
        }
        for process in &self.disabling {
            assert_eq!(process.enabled, EnabledStatus::Disabling);
        }
        for process in &self.disabled {
            assert_eq!(process.enabled, EnabledStatus::Disabled);
        }
        for process in [&self.enabled, &self.disabling, &self.disabled]
            .into_iter()
            .flatten()
        {
            for socket in &process.sockets {
                assert!(socket.sessions >= 0);
                if socket.concurrency > 0 {
                    assert!(socket.sessions <= socket.concurrency);
                }
            }
        }
    }

    pub fn inspect(&self) -> String {
        let mut out = format!(
            "group {} (waiters: {}, spawning: {}, restarting: {}, generation: {})\n",
            self.name,
            self.get_waitlist.len(),
            self.spawning,
            self.restarting,
            self.generation,
        );
        for (label, list) in [
            ("enabled", &self.enabled),
            ("disabling", &self.disabling),
            ("disabled", &self.disabled),
        ] {
            for process in list {
                out.push_str(&format!("  [{}] {}\n", label, process.inspect()));
            }
        }
        out
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        if !self.get_waitlist.is_empty() {
            debug!(group = %self.name, "group dropped with queued waiters; they resolve as errors");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::AddressSpec;
    use crate::pool::socket::{Socket, SocketProtocol};

    fn test_process(pid: u32, concurrency: i32) -> Process {
        Process::new(
            pid,
            format!("test-{}", pid),
            pid,
            0,
            vec![Socket::new(
                AddressSpec::Tcp(format!("127.0.0.1:{}", 9000 + pid)),
                SocketProtocol::Session,
                concurrency,
            )],
            SystemTime::now(),
        )
    }

    fn test_group() -> Group {
        Group::new("app.test".to_string(), Options::new("app.test"))
    }

    #[test]
    fn routes_to_least_busy_enabled_process() {
        let mut group = test_group();
        group.add_process(ListKind::Enabled, test_process(1, 10));
        group.add_process(ListKind::Enabled, test_process(2, 10));
        group.enabled[0].sockets[0].sessions = 5;
        group.rebuild_enabled_stats();

        assert_eq!(group.route(None), Some((ListKind::Enabled, 1)));
        group.verify_invariants();
    }

    #[test]
    fn sticky_routing_does_not_fall_back_when_busy() {
        let mut group = test_group();
        group.add_process(ListKind::Enabled, test_process(1, 1));
        group.add_process(ListKind::Enabled, test_process(2, 1));
        group.enabled[0].sockets[0].sessions = 1;
        group.rebuild_enabled_stats();

        // Process 1 (sticky id 1) is totally busy: the request must wait.
        assert_eq!(group.route(Some(1)), None);
        // Unknown sticky id falls through to least-busy.
        assert_eq!(group.route(Some(99)), Some((ListKind::Enabled, 1)));
    }

    #[test]
    fn routes_to_disabling_process_only_below_capacity() {
        let mut group = test_group();
        group.add_process(ListKind::Disabling, test_process(1, 1));

        assert_eq!(group.route(None), Some((ListKind::Disabling, 0)));
        group.disabling[0].sockets[0].sessions = 1;
        assert_eq!(group.route(None), None);
    }

    #[test]
    fn totally_busy_counter_tracks_moves() {
        let mut group = test_group();
        group.add_process(ListKind::Enabled, test_process(1, 1));
        group.enabled[0].sockets[0].sessions = 1;
        group.rebuild_enabled_stats();
        assert_eq!(group.n_enabled_totally_busy, 1);

        group.move_process(ListKind::Enabled, 0, ListKind::Disabling);
        assert_eq!(group.n_enabled_totally_busy, 0);
        assert_eq!(group.enabled_count(), 0);
        assert_eq!(group.disabling_count(), 1);
        group.verify_invariants();
    }
}
