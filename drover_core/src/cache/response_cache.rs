//! Fixed-size, open-addressed cache of complete HTTP responses.
//!
//! Sixteen slots, keyed by a fingerprint of method, host and path. Lookup
//! and store both probe a small window, so per-request cost is O(1); there
//! is no eviction machinery beyond overwriting expired entries, because the
//! surrounding state machine clears the whole table every measurement
//! window anyway.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use bytes::Bytes;

use crate::http::http_value::{HttpMethod, StatusCode};
use crate::http::meta::HeaderMap;
use crate::http::date::parse_imf_fixdate;

pub const CACHE_SLOTS: usize = 16;
const PROBE_WINDOW: usize = 4;
/// Largest body the cache records.
pub const MAX_ENTRY_BODY_SIZE: usize = 16 * 1024;

/// Headers on which a `Vary` response may vary and still be cached.
const VARY_ALLOWLIST: [&str; 1] = ["Accept-Encoding"];

#[derive(Clone)]
pub struct CacheEntry {
    pub key: u64,
    /// Status line plus recorded headers, CRLF separated, without the
    /// terminating blank line: the serving path appends synthesized fields.
    pub header_block: Bytes,
    pub body: Bytes,
    /// Recorded `Date` of the response, Unix epoch.
    pub date: i64,
    /// Entry is fresh strictly before this instant.
    pub expiry: i64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.expiry
    }
}

#[derive(Default)]
pub struct ResponseCache {
    slots: Vec<Option<CacheEntry>>,
    fetches: u64,
    hits: u64,
    stores: u64,
    store_successes: u64,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            slots: (0..CACHE_SLOTS).map(|_| None).collect(),
            fetches: 0,
            hits: 0,
            stores: 0,
            store_successes: 0,
        }
    }

    /// Fingerprint of the cache identity of a request.
    pub fn key_for(method: &HttpMethod, host: &str, path: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        method.as_str().hash(&mut hasher);
        host.hash(&mut hasher);
        path.hash(&mut hasher);
        hasher.finish()
    }

    pub fn fetch(&mut self, key: u64, now: i64) -> Option<CacheEntry> {
        self.fetches += 1;
        let base = key as usize % CACHE_SLOTS;
        for i in 0..PROBE_WINDOW {
            let slot = (base + i) % CACHE_SLOTS;
            if let Some(entry) = &self.slots[slot] {
                if entry.key == key {
                    if entry.is_fresh(now) {
                        self.hits += 1;
                        return self.slots[slot].clone();
                    }
                    self.slots[slot] = None;
                    return None;
                }
            }
        }
        None
    }

    /// Stores an entry, returning whether a slot could be claimed. An entry
    /// with the same key is replaced; otherwise an empty or expired slot in
    /// the probe window is used; with none available the store fails.
    pub fn store(&mut self, entry: CacheEntry, now: i64) -> bool {
        self.stores += 1;
        let base = entry.key as usize % CACHE_SLOTS;
        let mut candidate = None;
        for i in 0..PROBE_WINDOW {
            let slot = (base + i) % CACHE_SLOTS;
            match &self.slots[slot] {
                Some(existing) if existing.key == entry.key => {
                    candidate = Some(slot);
                    break;
                }
                Some(existing) if !existing.is_fresh(now) && candidate.is_none() => {
                    candidate = Some(slot);
                }
                None if candidate.is_none() => {
                    candidate = Some(slot);
                }
                _ => {}
            }
        }
        match candidate {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                self.store_successes += 1;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    pub fn reset_statistics(&mut self) {
        self.fetches = 0;
        self.hits = 0;
        self.stores = 0;
        self.store_successes = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn fetches(&self) -> u64 {
        self.fetches
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn stores(&self) -> u64 {
        self.stores
    }

    pub fn store_successes(&self) -> u64 {
        self.store_successes
    }

    pub fn hit_ratio(&self) -> f64 {
        if self.fetches == 0 {
            1.0
        } else {
            self.hits as f64 / self.fetches as f64
        }
    }

    pub fn store_success_ratio(&self) -> f64 {
        if self.stores == 0 {
            1.0
        } else {
            self.store_successes as f64 / self.stores as f64
        }
    }
}

/// Whether a request may be answered from (or populate) the cache: a GET
/// without a body and without auth-sensitive headers. (HEAD is excluded:
/// cached entries carry bodies.)
pub fn request_is_cache_eligible(method: &HttpMethod, headers: &HeaderMap) -> bool {
    *method == HttpMethod::GET
        && !headers.contains("Authorization")
        && !headers.contains("Cookie")
        && headers.content_length().unwrap_or(0) == 0
        && !headers.is_chunked()
}

/// Whether a response may be recorded: cacheable status, an explicit
/// freshness directive, no cookies being set, and `Vary` confined to the
/// allowlist.
pub fn response_is_cache_eligible(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_cacheable() || headers.contains("Set-Cookie") {
        return false;
    }
    for vary in headers.get_all("Vary") {
        for token in vary.split(',') {
            let token = token.trim();
            if !VARY_ALLOWLIST
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(token))
            {
                return false;
            }
        }
    }
    if let Some(cc) = headers.get("Cache-Control") {
        let cc = cc.to_ascii_lowercase();
        if cc.contains("no-store") || cc.contains("no-cache") || cc.contains("private") {
            return false;
        }
        if cc.contains("max-age") || cc.contains("s-maxage") {
            return true;
        }
    }
    headers.contains("Expires")
}

/// Expiry instant of a response, from `Cache-Control: max-age`/`s-maxage` or
/// `Expires`, anchored on the response's `Date` (or `now` without one).
pub fn freshness_expiry(headers: &HeaderMap, now: i64) -> Option<i64> {
    let date = response_date(headers).unwrap_or(now);
    if let Some(cc) = headers.get("Cache-Control") {
        let mut max_age: Option<i64> = None;
        for directive in cc.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if let Some(value) = directive.strip_prefix("s-maxage=") {
                if let Ok(secs) = value.parse::<i64>() {
                    return Some(date + secs);
                }
            }
            if let Some(value) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = value.parse::<i64>() {
                    max_age = Some(secs);
                }
            }
        }
        if let Some(secs) = max_age {
            return Some(date + secs);
        }
    }
    headers.get("Expires").and_then(parse_imf_fixdate)
}

/// The response's `Date` header as an epoch.
pub fn response_date(headers: &HeaderMap) -> Option<i64> {
    headers.get("Date").and_then(parse_imf_fixdate)
}

#[cfg(test)]
mod test {
    use super::*;

    fn entry(key: u64, expiry: i64) -> CacheEntry {
        CacheEntry {
            key,
            header_block: Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Type: text/plain"),
            body: Bytes::from_static(b"ok"),
            date: 0,
            expiry,
        }
    }

    #[test]
    fn stores_and_fetches_by_key() {
        let mut cache = ResponseCache::new();
        let key = ResponseCache::key_for(&HttpMethod::GET, "example.com", "/hello");
        assert!(cache.store(entry(key, 100), 0));
        assert!(cache.fetch(key, 50).is_some());
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.fetches(), 1);
    }

    #[test]
    fn expired_entries_do_not_hit() {
        let mut cache = ResponseCache::new();
        assert!(cache.store(entry(7, 100), 0));
        assert!(cache.fetch(7, 100).is_none());
        assert_eq!(cache.hits(), 0);
        // The expired entry was dropped from its slot.
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn store_fails_when_probe_window_is_full() {
        let mut cache = ResponseCache::new();
        // Keys that all land on the same probe window.
        let base = 3u64;
        for i in 0..4 {
            assert!(cache.store(entry(base + (i * CACHE_SLOTS) as u64, 1000), 0));
        }
        assert!(!cache.store(entry(base + (4 * CACHE_SLOTS) as u64, 1000), 0));
        assert_eq!(cache.store_successes(), 4);
        assert_eq!(cache.stores(), 5);
    }

    #[test]
    fn ratios_follow_counters() {
        let mut cache = ResponseCache::new();
        let key = 9;
        cache.store(entry(key, 1000), 0);
        for _ in 0..5 {
            cache.fetch(key, 1);
        }
        for _ in 0..5 {
            cache.fetch(key + 1, 1);
        }
        assert!((cache.hit_ratio() - 0.5).abs() < f64::EPSILON);
        cache.reset_statistics();
        assert_eq!(cache.fetches(), 0);
        assert!((cache.hit_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn eligibility_rules() {
        let mut headers = HeaderMap::new();
        assert!(request_is_cache_eligible(&HttpMethod::GET, &headers));
        assert!(!request_is_cache_eligible(&HttpMethod::POST, &headers));
        headers.set("Authorization", "Basic abc");
        assert!(!request_is_cache_eligible(&HttpMethod::GET, &headers));

        let mut response = HeaderMap::new();
        response.set("Cache-Control", "max-age=60");
        assert!(response_is_cache_eligible(StatusCode::OK, &response));
        response.set("Set-Cookie", "session=1");
        assert!(!response_is_cache_eligible(StatusCode::OK, &response));

        let mut varying = HeaderMap::new();
        varying.set("Cache-Control", "max-age=60");
        varying.set("Vary", "Accept-Encoding");
        assert!(response_is_cache_eligible(StatusCode::OK, &varying));
        varying.set("Vary", "User-Agent");
        assert!(!response_is_cache_eligible(StatusCode::OK, &varying));
    }

    #[test]
    fn freshness_prefers_s_maxage() {
        let mut headers = HeaderMap::new();
        headers.set("Date", "Thu, 01 Jan 1970 00:00:10 GMT");
        headers.set("Cache-Control", "max-age=60, s-maxage=120");
        assert_eq!(freshness_expiry(&headers, 10), Some(130));
        headers.set("Cache-Control", "max-age=60");
        assert_eq!(freshness_expiry(&headers, 10), Some(70));
    }
}
