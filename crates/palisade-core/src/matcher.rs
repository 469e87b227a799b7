//! Lock-free handle to the currently active trie.
//!
//! The matcher holds an `ArcSwap` over an immutable `{trie, entry count}`
//! snapshot. Per-request lookups load the snapshot without locking; the EDL
//! updater replaces it wholesale. Readers always observe either the old or
//! the new snapshot, never a partially constructed one.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::trie::IpTrie;

struct TrieSnapshot {
    trie: IpTrie,
    entries: u64,
}

/// Thread-safe IP matcher with lock-free reads and atomic replacement.
pub struct IpMatcher {
    current: ArcSwap<TrieSnapshot>,
}

impl IpMatcher {
    /// Creates a matcher holding an empty trie.
    #[must_use]
    pub fn new() -> Self {
        Self { current: ArcSwap::from_pointee(TrieSnapshot { trie: IpTrie::new(), entries: 0 }) }
    }

    /// Checks a textual IP address against the current trie.
    ///
    /// Invalid input is never an error on this path: anything that does not
    /// parse as an IP address is simply not in the set.
    #[must_use]
    pub fn contains(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>().map_or(false, |addr| self.contains_addr(addr))
    }

    /// Checks a parsed IP address against the current trie.
    #[must_use]
    pub fn contains_addr(&self, addr: IpAddr) -> bool {
        self.current.load().trie.contains(addr)
    }

    /// Atomically replaces the current trie and entry count.
    pub fn update(&self, trie: IpTrie, entries: u64) {
        self.current.store(Arc::new(TrieSnapshot { trie, entries }));
    }

    /// Approximate number of prefixes in the current trie (telemetry only).
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.current.load().entries
    }
}

impl Default for IpMatcher {
    fn default() -> Self {
        Self::new()
    }
}
