//! Bit-wise binary trie over IPv4/IPv6 prefixes.
//!
//! The trie stores one node per prefix bit in a single flat arena; children
//! are `u32` indices into that arena rather than heap pointers. A lookup
//! walks the address bits MSB-first and succeeds as soon as it passes any
//! terminal node, so a shorter covering prefix always wins without explicit
//! longest-prefix bookkeeping.
//!
//! Tries are built once (by [`insert`](IpTrie::insert) or by the binary
//! loader in [`binary`]) and are immutable afterwards; the read path needs
//! no synchronization.

pub mod binary;

use std::net::{IpAddr, Ipv6Addr};

use ipnet::IpNet;

pub use binary::{load, TrieLoadError, FORMAT_VERSION, MAGIC};

/// Sentinel arena index meaning "no child".
pub(crate) const NO_CHILD: u32 = u32::MAX;

#[derive(Debug, Clone, Copy)]
pub(crate) struct TrieNode {
    pub(crate) zero: u32,
    pub(crate) one: u32,
    pub(crate) terminal: bool,
    /// Distance from the root; carried by the wire format.
    pub(crate) depth: u8,
}

impl TrieNode {
    pub(crate) fn empty(depth: u8) -> Self {
        Self { zero: NO_CHILD, one: NO_CHILD, terminal: false, depth }
    }
}

/// Binary trie with separate IPv4 and IPv6 roots sharing one node arena.
#[derive(Debug)]
pub struct IpTrie {
    nodes: Vec<TrieNode>,
    root_v4: u32,
    root_v6: u32,
}

impl IpTrie {
    /// Creates an empty trie containing no prefixes.
    #[must_use]
    pub fn new() -> Self {
        Self { nodes: vec![TrieNode::empty(0), TrieNode::empty(0)], root_v4: 0, root_v6: 1 }
    }

    pub(crate) fn from_parts(nodes: Vec<TrieNode>, root_v4: u32, root_v6: u32) -> Self {
        Self { nodes, root_v4, root_v6 }
    }

    /// Total number of nodes in the arena.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Adds a prefix to the trie.
    pub fn insert(&mut self, net: &IpNet) {
        match net {
            IpNet::V4(net) => {
                let ip = u32::from(net.addr());
                let root = self.root_v4;
                self.insert_bits(root, net.prefix_len(), |i| u64::from((ip >> (31 - i)) & 1));
            }
            IpNet::V6(net) => {
                let (high, low) = split_v6(net.addr());
                let root = self.root_v6;
                self.insert_bits(root, net.prefix_len(), |i| v6_bit(high, low, i));
            }
        }
    }

    fn insert_bits<F: Fn(u8) -> u64>(&mut self, root: u32, prefix_len: u8, bit_at: F) {
        let mut cursor = root as usize;
        for i in 0..prefix_len {
            let next = if bit_at(i) == 0 { self.nodes[cursor].zero } else { self.nodes[cursor].one };
            let next = if next == NO_CHILD {
                let idx = self.nodes.len() as u32;
                self.nodes.push(TrieNode::empty(i + 1));
                if bit_at(i) == 0 {
                    self.nodes[cursor].zero = idx;
                } else {
                    self.nodes[cursor].one = idx;
                }
                idx
            } else {
                next
            };
            cursor = next as usize;
        }
        self.nodes[cursor].terminal = true;
    }

    /// Returns `true` if any inserted prefix covers `addr`.
    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(addr) => {
                let ip = u32::from(addr);
                self.walk(self.root_v4, 32, |i| u64::from((ip >> (31 - i)) & 1))
            }
            IpAddr::V6(addr) => {
                let (high, low) = split_v6(addr);
                self.walk(self.root_v6, 128, |i| v6_bit(high, low, i))
            }
        }
    }

    fn walk<F: Fn(u8) -> u64>(&self, root: u32, width: u8, bit_at: F) -> bool {
        let mut node = &self.nodes[root as usize];
        // A /0 prefix terminates on the root itself.
        if node.terminal {
            return true;
        }
        for i in 0..width {
            let next = if bit_at(i) == 0 { node.zero } else { node.one };
            if next == NO_CHILD {
                return false;
            }
            node = &self.nodes[next as usize];
            if node.terminal {
                return true;
            }
        }
        false
    }
}

impl Default for IpTrie {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits an IPv6 address into two 64-bit halves for cheap bit extraction.
fn split_v6(addr: Ipv6Addr) -> (u64, u64) {
    let value = u128::from(addr);
    ((value >> 64) as u64, value as u64)
}

fn v6_bit(high: u64, low: u64, i: u8) -> u64 {
    if i < 64 {
        (high >> (63 - i)) & 1
    } else {
        (low >> (127 - i)) & 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_trie_contains_nothing() {
        let trie = IpTrie::new();
        assert!(!trie.contains(addr("10.0.0.1")));
        assert!(!trie.contains(addr("::1")));
    }

    #[test]
    fn test_insert_and_contains_ipv4() {
        let mut trie = IpTrie::new();
        trie.insert(&net("192.168.1.0/24"));
        trie.insert(&net("10.0.0.0/8"));
        trie.insert(&net("203.0.113.7/32"));

        assert!(trie.contains(addr("192.168.1.1")));
        assert!(trie.contains(addr("192.168.1.255")));
        assert!(!trie.contains(addr("192.168.2.1")));

        assert!(trie.contains(addr("10.200.0.1")));
        assert!(!trie.contains(addr("11.0.0.1")));

        assert!(trie.contains(addr("203.0.113.7")));
        assert!(!trie.contains(addr("203.0.113.8")));
    }

    #[test]
    fn test_insert_and_contains_ipv6() {
        let mut trie = IpTrie::new();
        trie.insert(&net("2001:db8::/32"));
        trie.insert(&net("fe80::1/128"));

        assert!(trie.contains(addr("2001:db8::1")));
        assert!(trie.contains(addr("2001:db8:ffff::1")));
        assert!(!trie.contains(addr("2001:db9::1")));

        assert!(trie.contains(addr("fe80::1")));
        assert!(!trie.contains(addr("fe80::2")));
    }

    #[test]
    fn test_low_half_ipv6_bits_are_honored() {
        let mut trie = IpTrie::new();
        // Prefix longer than 64 bits exercises the low u64 half.
        trie.insert(&net("2001:db8::/96"));

        assert!(trie.contains(addr("2001:db8::42")));
        assert!(!trie.contains(addr("2001:db8::1:0:42")));
    }

    #[test]
    fn test_zero_length_prefix_matches_family() {
        let mut trie = IpTrie::new();
        trie.insert(&net("0.0.0.0/0"));

        assert!(trie.contains(addr("1.2.3.4")));
        assert!(trie.contains(addr("255.255.255.255")));
        // Family separation: the v6 side is untouched.
        assert!(!trie.contains(addr("::1")));

        trie.insert(&net("::/0"));
        assert!(trie.contains(addr("::1")));
    }

    #[test]
    fn test_mixed_families() {
        let mut trie = IpTrie::new();
        trie.insert(&net("198.51.100.0/24"));
        trie.insert(&net("2001:db8::/48"));

        assert!(trie.contains(addr("198.51.100.9")));
        assert!(trie.contains(addr("2001:db8:0:1::1")));
        assert!(!trie.contains(addr("198.51.101.9")));
        assert!(!trie.contains(addr("2001:db8:1::1")));
    }

    #[test]
    fn test_covering_prefix_wins_over_missing_longer_path() {
        let mut trie = IpTrie::new();
        trie.insert(&net("10.0.0.0/8"));
        trie.insert(&net("10.1.0.0/16"));

        // Both the nested and the covering prefix match.
        assert!(trie.contains(addr("10.1.2.3")));
        assert!(trie.contains(addr("10.200.0.1")));
    }

    proptest! {
        /// The trie must agree with a naive scan of the inserted prefixes for
        /// any IPv4 address.
        #[test]
        fn prop_matches_naive_reference_v4(
            prefixes in prop::collection::vec((any::<u32>(), 0u8..=32), 0..32),
            probes in prop::collection::vec(any::<u32>(), 1..64),
        ) {
            let mut trie = IpTrie::new();
            let mut nets = Vec::new();
            for (raw, len) in prefixes {
                let net = IpNet::V4(
                    ipnet::Ipv4Net::new(Ipv4Addr::from(raw), len).unwrap().trunc(),
                );
                trie.insert(&net);
                nets.push(net);
            }

            for raw in probes {
                let probe = IpAddr::V4(Ipv4Addr::from(raw));
                let expected = nets.iter().any(|n| n.contains(&probe));
                prop_assert_eq!(trie.contains(probe), expected, "probe {}", probe);
            }
        }
    }
}
