//! The turbocaching state machine wrapped around the response cache.
//!
//! The cache is a burst cache: it only pays off when the same response is
//! served many times within a couple of seconds. So the table is cleared on
//! every measurement window, and when the hit ratio under load turns out to
//! be poor the whole thing turns itself off for a cool-off period rather
//! than keep burning cycles on useless bookkeeping.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::buffer::MbufPool;
use crate::http::http_value::HttpVersion;

use super::response_cache::{CacheEntry, ResponseCache};

/// Measurement window while enabled, seconds.
pub const ENABLED_TIMEOUT: i64 = 2;
/// Cool-off after self-disabling, seconds.
pub const TEMPORARY_DISABLE_TIMEOUT: i64 = 10;
/// Minimum fetches in a window before the hit ratio is judged.
pub const FETCH_THRESHOLD: u64 = 20;
/// Minimum stores in a window before the store ratio is judged.
pub const STORE_THRESHOLD: u64 = 20;
pub const MIN_HIT_RATIO: f64 = 0.5;
pub const MIN_STORE_SUCCESS_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Permanently off by operator decision; never re-evaluated.
    Disabled,
    Enabled,
    /// Self-disabled after a poor window; returns to Enabled after the
    /// cool-off.
    TemporarilyDisabled,
}

pub struct TurboCaching {
    state: CacheState,
    next_timeout: i64,
    pub cache: ResponseCache,
}

impl TurboCaching {
    pub fn new(initially_enabled: bool, now: i64) -> Self {
        Self {
            state: if initially_enabled {
                CacheState::Enabled
            } else {
                CacheState::Disabled
            },
            next_timeout: now + ENABLED_TIMEOUT,
            cache: ResponseCache::new(),
        }
    }

    pub fn state(&self) -> CacheState {
        self.state
    }

    pub fn is_enabled(&self) -> bool {
        self.state == CacheState::Enabled
    }

    /// Re-evaluates the state. Called on event-loop wakeups, not per
    /// request, so the per-request cost stays at one lookup and one counter
    /// bump.
    pub fn update_state(&mut self, now: i64) {
        if self.state == CacheState::Disabled || now < self.next_timeout {
            return;
        }

        match self.state {
            CacheState::Enabled => {
                if self.cache.fetches() >= FETCH_THRESHOLD
                    && self.cache.hit_ratio() < MIN_HIT_RATIO
                {
                    info!(
                        hits = self.cache.hits(),
                        fetches = self.cache.fetches(),
                        "poor turbocaching hit ratio detected; temporarily disabling \
                         turbocaching for {} seconds",
                        TEMPORARY_DISABLE_TIMEOUT
                    );
                    self.state = CacheState::TemporarilyDisabled;
                    self.next_timeout = now + TEMPORARY_DISABLE_TIMEOUT;
                } else if self.cache.stores() >= STORE_THRESHOLD
                    && self.cache.store_success_ratio() < MIN_STORE_SUCCESS_RATIO
                {
                    info!(
                        store_successes = self.cache.store_successes(),
                        stores = self.cache.stores(),
                        "poor turbocaching store success ratio detected; temporarily \
                         disabling turbocaching for {} seconds",
                        TEMPORARY_DISABLE_TIMEOUT
                    );
                    self.state = CacheState::TemporarilyDisabled;
                    self.next_timeout = now + TEMPORARY_DISABLE_TIMEOUT;
                } else {
                    debug!("clearing turbocache");
                    self.next_timeout = now + ENABLED_TIMEOUT;
                }
                // A burst cache: every window starts from a clean slate, and
                // the table is empty through any disabled period.
                self.cache.reset_statistics();
                self.cache.clear();
            }
            CacheState::TemporarilyDisabled => {
                info!("re-enabling turbocaching");
                self.state = CacheState::Enabled;
                self.next_timeout = now + ENABLED_TIMEOUT;
            }
            CacheState::Disabled => unreachable!(),
        }
    }

    /// Serializes a cached response for a one-shot write: recorded header
    /// block, synthesized `Content-Length`, `Age` and server identification,
    /// the connection decision, and the body. Drawn from the mbuf pool when
    /// it fits one buffer, else from an exact-size allocation.
    pub fn render_response(
        &self,
        mbufs: &MbufPool,
        entry: &CacheEntry,
        now: i64,
        http_version: HttpVersion,
        keep_alive: bool,
        show_version_in_header: bool,
    ) -> Bytes {
        let age = (now - entry.date).max(0);
        let version_line = if show_version_in_header {
            concat!("X-Powered-By: Drover ", env!("CARGO_PKG_VERSION"), "\r\n")
        } else {
            "X-Powered-By: Drover\r\n"
        };

        let mut head = String::with_capacity(128);
        head.push_str(&format!("Content-Length: {}\r\n", entry.body.len()));
        head.push_str(&format!("Age: {}\r\n", age));
        head.push_str(version_line);
        match (keep_alive, http_version) {
            // HTTP < 1.1 defaults to close; advertise the keep-alive we want.
            (true, HttpVersion::Http10) => head.push_str("Connection: keep-alive\r\n"),
            // HTTP 1.1 defaults to keep-alive; advertise the close we want.
            (false, HttpVersion::Http11) => head.push_str("Connection: close\r\n"),
            _ => {}
        }

        let total =
            entry.header_block.len() + 2 + head.len() + 2 + entry.body.len();
        let mut buffer = if total <= mbufs.chunk_size() {
            mbufs.get()
        } else {
            BytesMut::with_capacity(total)
        };
        buffer.put_slice(&entry.header_block);
        buffer.put_slice(b"\r\n");
        buffer.put_slice(head.as_bytes());
        buffer.put_slice(b"\r\n");
        buffer.put_slice(&entry.body);
        buffer.freeze()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(key: u64) -> CacheEntry {
        CacheEntry {
            key,
            header_block: Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain"),
            body: Bytes::from_static(b"ok"),
            date: 100,
            expiry: 1000,
        }
    }

    #[test]
    fn disables_itself_on_poor_hit_ratio() {
        let mut turbo = TurboCaching::new(true, 0);
        turbo.cache.store(entry(1), 100);
        // 30 fetches, 5 hits.
        for _ in 0..5 {
            assert!(turbo.cache.fetch(1, 100).is_some());
        }
        for i in 0..25 {
            assert!(turbo.cache.fetch(1000 + i, 100).is_none());
        }

        turbo.update_state(ENABLED_TIMEOUT);
        assert_eq!(turbo.state(), CacheState::TemporarilyDisabled);
        // The table was cleared on the transition.
        assert_eq!(turbo.cache.entry_count(), 0);
        assert_eq!(turbo.cache.fetches(), 0);

        // Still disabled inside the cool-off.
        turbo.update_state(ENABLED_TIMEOUT + TEMPORARY_DISABLE_TIMEOUT - 1);
        assert_eq!(turbo.state(), CacheState::TemporarilyDisabled);

        turbo.update_state(ENABLED_TIMEOUT + TEMPORARY_DISABLE_TIMEOUT);
        assert_eq!(turbo.state(), CacheState::Enabled);
        assert_eq!(turbo.cache.fetches(), 0);
    }

    #[test]
    fn good_windows_stay_enabled_but_clear_the_table() {
        let mut turbo = TurboCaching::new(true, 0);
        turbo.cache.store(entry(1), 100);
        for _ in 0..30 {
            assert!(turbo.cache.fetch(1, 100).is_some());
        }
        turbo.update_state(ENABLED_TIMEOUT);
        assert_eq!(turbo.state(), CacheState::Enabled);
        assert_eq!(turbo.cache.entry_count(), 0);
    }

    #[test]
    fn operator_disabled_is_permanent() {
        let mut turbo = TurboCaching::new(false, 0);
        turbo.update_state(1_000_000);
        assert_eq!(turbo.state(), CacheState::Disabled);
        assert!(!turbo.is_enabled());
    }

    #[test]
    fn rendered_response_synthesizes_age_and_length() {
        let turbo = TurboCaching::new(true, 0);
        let mbufs = MbufPool::default();
        let bytes = turbo.render_response(
            &mbufs,
            &entry(1),
            130,
            HttpVersion::Http11,
            true,
            false,
        );
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Age: 30\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.contains("X-Powered-By: Drover\r\n"));
        assert!(!text.contains("Connection: close"));
        assert!(text.ends_with("\r\n\r\nok"));
    }
}
