//! Shared helpers for unit tests: unsigned JWT fabrication and `ELLIOTRIE`
//! blob encoding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ipnet::IpNet;

use crate::trie;

/// Builds an unsigned three-segment JWT with the given JSON payload.
pub(crate) fn fake_jwt(payload: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{header}.{body}.sig")
}

/// Builds a bootstrap token whose issuer is `issuer` and whose component
/// type is the expected one.
pub(crate) fn bootstrap_token(issuer: &str, deployment_id: &str) -> String {
    fake_jwt(&serde_json::json!({
        "iss": issuer,
        "component_type": crate::api::COMPONENT_TYPE,
        "deployment_id": deployment_id,
    }))
}

#[derive(Clone)]
struct RawNode {
    zero: u32,
    one: u32,
    terminal: bool,
    depth: u8,
}

/// Serializes prefixes into an `ELLIOTRIE` v2 blob by building the node
/// arena the loader expects.
pub(crate) fn encode_trie_blob(prefixes: &[&str]) -> Vec<u8> {
    let empty = RawNode { zero: u32::MAX, one: u32::MAX, terminal: false, depth: 0 };
    let mut nodes = vec![empty.clone(), empty];
    let (root_v4, root_v6) = (0u32, 1u32);

    for prefix in prefixes {
        let net: IpNet = prefix.parse().expect("test prefix should parse");
        let (mut cursor, bits): (usize, Vec<u8>) = match net {
            IpNet::V4(n) => {
                let ip = u32::from(n.addr());
                let bits = (0..n.prefix_len()).map(|i| ((ip >> (31 - i)) & 1) as u8).collect();
                (root_v4 as usize, bits)
            }
            IpNet::V6(n) => {
                let ip = u128::from(n.addr());
                let bits = (0..n.prefix_len()).map(|i| ((ip >> (127 - i)) & 1) as u8).collect();
                (root_v6 as usize, bits)
            }
        };

        for (depth, bit) in bits.into_iter().enumerate() {
            let next = if bit == 0 { nodes[cursor].zero } else { nodes[cursor].one };
            let next = if next == u32::MAX {
                let idx = nodes.len() as u32;
                nodes.push(RawNode {
                    zero: u32::MAX,
                    one: u32::MAX,
                    terminal: false,
                    depth: depth as u8 + 1,
                });
                if bit == 0 {
                    nodes[cursor].zero = idx;
                } else {
                    nodes[cursor].one = idx;
                }
                idx
            } else {
                next
            };
            cursor = next as usize;
        }
        nodes[cursor].terminal = true;
    }

    let mut out = Vec::new();
    out.extend_from_slice(trie::MAGIC);
    out.extend_from_slice(&trie::FORMAT_VERSION.to_be_bytes());
    out.push(0);
    out.extend_from_slice(&(nodes.len() as u32).to_be_bytes());
    out.extend_from_slice(&root_v4.to_be_bytes());
    out.extend_from_slice(&root_v6.to_be_bytes());
    for node in &nodes {
        out.extend_from_slice(&node.zero.to_be_bytes());
        out.extend_from_slice(&node.one.to_be_bytes());
        out.push(u8::from(node.terminal) | (node.depth << 1));
    }
    out
}
