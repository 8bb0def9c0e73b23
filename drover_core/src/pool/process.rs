//! The Process entity: one spawned application worker.

use std::time::{Instant, SystemTime};

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use super::socket::Socket;
use super::spawner::OutputStream;

/// Rotation status of a process within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnabledStatus {
    Enabled,
    Disabling,
    Disabled,
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeStatus {
    Alive,
    ShuttingDown,
    Dead,
}

/// Out-of-band-work status of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OobwStatus {
    NotActive,
    Requested,
    InProgress,
}

pub struct Process {
    /// Server-assigned process id, immutable.
    pub pid: u32,
    /// Globally unique process identifier, assigned at spawn time.
    pub gupid: String,
    /// Sticky-session routing id, unique within the group.
    pub sticky_session_id: u32,
    pub spawn_start: SystemTime,
    pub spawn_end: SystemTime,
    /// Restart generation this process belongs to.
    pub generation: u64,

    pub sockets: Vec<Socket>,
    pub enabled: EnabledStatus,
    pub life_status: LifeStatus,
    pub oobw: OobwStatus,
    /// Requests served over this process's lifetime.
    pub processed: u64,
    pub last_used: Instant,
}

impl Process {
    pub fn new(
        pid: u32,
        gupid: String,
        sticky_session_id: u32,
        generation: u64,
        sockets: Vec<Socket>,
        spawn_start: SystemTime,
    ) -> Self {
        Self {
            pid,
            gupid,
            sticky_session_id,
            spawn_start,
            spawn_end: SystemTime::now(),
            generation,
            sockets,
            enabled: EnabledStatus::Enabled,
            life_status: LifeStatus::Alive,
            oobw: OobwStatus::NotActive,
            processed: 0,
            last_used: Instant::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.life_status == LifeStatus::Alive
    }

    pub fn session_count(&self) -> i32 {
        self.sockets.iter().map(|s| s.sessions).sum()
    }

    pub fn is_idle(&self) -> bool {
        self.session_count() == 0
    }

    /// A process is totally busy iff every socket is at its concurrency
    /// limit. A process with any unlimited socket is never totally busy.
    pub fn is_totally_busy(&self) -> bool {
        !self.sockets.is_empty() && self.sockets.iter().all(|s| s.is_totally_busy())
    }

    /// Whether a request may be routed here: some socket below its limit,
    /// the process still in rotation (enabled or disabling) and alive.
    pub fn can_be_routed_to(&self) -> bool {
        self.life_status == LifeStatus::Alive
            && matches!(
                self.enabled,
                EnabledStatus::Enabled | EnabledStatus::Disabling
            )
            && !self.is_totally_busy()
    }

    /// Process-level busyness, same scale as [`Socket::busyness`]: sessions
    /// over summed concurrency, with any unlimited socket making the whole
    /// process sort as unlimited.
    pub fn busyness(&self) -> i64 {
        let sessions = self.session_count() as i64;
        let mut concurrency: i64 = 0;
        for socket in &self.sockets {
            if socket.concurrency <= 0 {
                return sessions;
            }
            concurrency += socket.concurrency as i64;
        }
        if concurrency == 0 {
            sessions
        } else {
            sessions * i32::MAX as i64 / concurrency
        }
    }

    /// Picks the least busy socket that is below its limit and checks a
    /// session out of it. Returns the socket index, or None when the process
    /// is totally busy.
    pub fn new_session(&mut self, now: Instant) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (i, socket) in self.sockets.iter().enumerate() {
            if socket.is_totally_busy() {
                continue;
            }
            match best {
                Some(b) if self.sockets[b].busyness() <= socket.busyness() => {}
                _ => best = Some(i),
            }
        }
        let index = best?;
        self.sockets[index].sessions += 1;
        self.last_used = now;
        Some(index)
    }

    /// Reverses [`Process::new_session`]'s accounting for one close.
    pub fn session_closed(&mut self, socket_index: usize, now: Instant) {
        let socket = &mut self.sockets[socket_index];
        debug_assert!(socket.sessions > 0);
        socket.sessions -= 1;
        self.processed += 1;
        self.last_used = now;
    }

    pub fn inspect(&self) -> String {
        format!(
            "pid={} gupid={} sessions={} busyness={} processed={}",
            self.pid,
            self.gupid,
            self.session_count(),
            self.busyness(),
            self.processed
        )
    }
}

/// Forwards one output stream of a worker to the log, line by line, with the
/// configured prefix. Runs until the stream reaches EOF.
pub fn spawn_output_pump(stream: OutputStream, prefix: String, is_stderr: bool) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if is_stderr {
                        warn!(target: "drover_core::app_output", "{} {}", prefix, line);
                    } else {
                        info!(target: "drover_core::app_output", "{} {}", prefix, line);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(target: "drover_core::app_output", "{} [output pump error: {}]", prefix, err);
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::AddressSpec;
    use crate::pool::socket::SocketProtocol;

    fn process_with(concurrencies: &[i32]) -> Process {
        let sockets = concurrencies
            .iter()
            .enumerate()
            .map(|(i, c)| {
                Socket::new(
                    AddressSpec::Tcp(format!("127.0.0.1:{}", 9000 + i)),
                    SocketProtocol::Session,
                    *c,
                )
            })
            .collect();
        Process::new(
            1,
            "test-1".to_string(),
            1,
            0,
            sockets,
            SystemTime::now(),
        )
    }

    #[test]
    fn session_accounting_stays_within_bounds() {
        let mut process = process_with(&[2]);
        let now = Instant::now();
        assert!(process.new_session(now).is_some());
        assert!(process.new_session(now).is_some());
        assert!(process.is_totally_busy());
        assert_eq!(process.new_session(now), None);
        process.session_closed(0, now);
        assert!(!process.is_totally_busy());
        assert_eq!(process.session_count(), 1);
        assert_eq!(process.processed, 1);
    }

    #[test]
    fn new_session_picks_least_busy_socket() {
        let mut process = process_with(&[2, 2]);
        let now = Instant::now();
        let first = process.new_session(now).unwrap();
        let second = process.new_session(now).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn unlimited_process_sorts_below_limited_at_equal_load() {
        let mut limited = process_with(&[4]);
        let mut unlimited = process_with(&[0]);
        let now = Instant::now();
        for _ in 0..2 {
            limited.new_session(now);
            unlimited.new_session(now);
        }
        assert!(unlimited.busyness() < limited.busyness());
        assert!(!unlimited.is_totally_busy());
    }
}
