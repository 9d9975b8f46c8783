//! Bounded event deduplication.
//!
//! The probe host replays recent history on every scan, so the same
//! event is seen many times. The cache keys events by a SHA-256 digest
//! of the normalized line and lives for the process lifetime; operators
//! restart the process to clear it. Growth is bounded by evicting the
//! oldest insertions, which is safe because scans only cover a short
//! trailing window of log history.

use std::collections::{HashSet, VecDeque};

use sha2::{Digest, Sha256};

/// Default capacity of the cache.
pub const DEFAULT_CAPACITY: usize = 65_536;

/// Insertion-ordered set of event digests.
pub struct DedupCache {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl DedupCache {
    /// Create a cache bounded to `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Digest of one normalized log line.
    #[must_use]
    pub fn digest(line: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(line.as_bytes());
        let digest = hasher.finalize();
        let mut out = String::with_capacity(64);
        for byte in digest {
            use std::fmt::Write;
            let _ = write!(out, "{byte:02x}");
        }
        out
    }

    /// Record a line; returns true when it was seen before.
    pub fn check_and_insert(&mut self, line: &str) -> bool {
        let digest = Self::digest(line);
        if self.seen.contains(&digest) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(digest.clone());
        self.order.push_back(digest);
        false
    }

    /// Number of remembered digests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
