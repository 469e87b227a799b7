//! Loader for the pre-computed `ELLIOTRIE` wire format.
//!
//! The payload is a header followed by a flat array of node records; the
//! loader materializes that array as-is into the trie arena, so a loaded
//! trie lives in one contiguous allocation and lookups stay in a small
//! working set. All integers are big-endian.
//!
//! Layout (version 2):
//!
//! ```text
//! bytes 0..9   ASCII "ELLIOTRIE"
//! bytes 9..11  u16 format version (= 2)
//! byte  11     u8  flags (reserved, accepted as-is)
//! bytes 12..16 u32 total node count
//! bytes 16..20 u32 IPv4 root index (0xFFFFFFFF = absent)
//! bytes 20..24 u32 IPv6 root index (0xFFFFFFFF = absent)
//! then per node: u32 left child, u32 right child, u8 flags
//!                (bit 0 = terminal, bits 1..7 = depth)
//! ```

use std::io::Read;
use std::time::Instant;

use thiserror::Error;

use super::{IpTrie, TrieNode, NO_CHILD};

/// Magic tag identifying a pre-computed trie stream.
pub const MAGIC: &[u8; 9] = b"ELLIOTRIE";

/// The only wire format version this loader accepts.
pub const FORMAT_VERSION: u16 = 2;

/// Rough serialized-nodes-per-prefix ratio used for the entry estimate.
const NODES_PER_ENTRY: u64 = 7;

/// Errors produced while loading a serialized trie.
#[derive(Debug, Error)]
pub enum TrieLoadError {
    /// The stream does not start with the `ELLIOTRIE` magic tag.
    #[error("invalid magic header, not an ELLIOTRIE stream")]
    InvalidMagic,

    /// The stream declares a format version other than [`FORMAT_VERSION`].
    #[error("unsupported ELLIOTRIE format version {0}")]
    UnsupportedVersion(u16),

    /// A node record references a child index outside the arena.
    #[error("node {node} references child {child} outside arena of {total} nodes")]
    InvalidChildIndex { node: u32, child: u32, total: u32 },

    /// A root index in the header is outside the arena.
    #[error("root index {root} outside arena of {total} nodes")]
    InvalidRootIndex { root: u32, total: u32 },

    /// Short read or other I/O failure, surfaced verbatim.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Loads a pre-computed trie from `reader`.
///
/// Returns the trie together with an approximate count of the prefixes it
/// holds. The count is derived from the node count and is telemetry only;
/// callers must not treat it as exact.
///
/// # Errors
///
/// Returns a [`TrieLoadError`] when the magic tag or version do not match,
/// when a record references an index outside the arena, or when the stream
/// ends early.
pub fn load<R: Read>(mut reader: R) -> Result<(IpTrie, u64), TrieLoadError> {
    let start = Instant::now();

    let mut magic = [0u8; 9];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(TrieLoadError::InvalidMagic);
    }

    let version = read_u16(&mut reader)?;
    if version != FORMAT_VERSION {
        return Err(TrieLoadError::UnsupportedVersion(version));
    }

    let _flags = read_u8(&mut reader)?;
    let total = read_u32(&mut reader)?;
    let root_v4 = read_u32(&mut reader)?;
    let root_v6 = read_u32(&mut reader)?;

    // Single contiguous allocation for the whole arena.
    let mut nodes = Vec::with_capacity(total as usize);
    for index in 0..total {
        let zero = read_u32(&mut reader)?;
        let one = read_u32(&mut reader)?;
        let flags = read_u8(&mut reader)?;

        for child in [zero, one] {
            if child != NO_CHILD && child >= total {
                return Err(TrieLoadError::InvalidChildIndex { node: index, child, total });
            }
        }

        nodes.push(TrieNode { zero, one, terminal: flags & 0x01 != 0, depth: flags >> 1 });
    }

    let root_v4 = resolve_root(&mut nodes, root_v4, total)?;
    let root_v6 = resolve_root(&mut nodes, root_v6, total)?;

    tracing::debug!(
        nodes = total,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "loaded pre-computed trie"
    );

    Ok((IpTrie::from_parts(nodes, root_v4, root_v6), u64::from(total) / NODES_PER_ENTRY))
}

/// Maps a header root index to an arena index, appending a fresh empty node
/// when the header marks the family as absent.
fn resolve_root(
    nodes: &mut Vec<TrieNode>,
    root: u32,
    total: u32,
) -> Result<u32, TrieLoadError> {
    if root == NO_CHILD {
        let idx = nodes.len() as u32;
        nodes.push(TrieNode::empty(0));
        return Ok(idx);
    }
    if root >= total {
        return Err(TrieLoadError::InvalidRootIndex { root, total });
    }
    Ok(root)
}

fn read_u8<R: Read>(reader: &mut R) -> Result<u8, std::io::Error> {
    let mut buf = [0u8; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, std::io::Error> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, std::io::Error> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}
