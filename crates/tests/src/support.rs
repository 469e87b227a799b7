//! Mock control-plane helpers: unsigned bootstrap tokens and `ELLIOTRIE`
//! payload encoding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ipnet::IpNet;
use mockito::ServerGuard;

const MAGIC: &[u8; 9] = b"ELLIOTRIE";
const FORMAT_VERSION: u16 = 2;
const NO_NODE: u32 = u32::MAX;

/// Builds an unsigned three-segment JWT carrying the expected claims for
/// `issuer`.
#[must_use]
pub fn bootstrap_token(issuer: &str, deployment_id: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = serde_json::json!({
        "iss": issuer,
        "component_type": "ellio_traefik_middleware_plugin",
        "deployment_id": deployment_id,
    });
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{header}.{body}.sig")
}

#[derive(Clone)]
struct RawNode {
    zero: u32,
    one: u32,
    terminal: bool,
    depth: u8,
}

/// Serializes prefixes into an `ELLIOTRIE` v2 payload.
#[must_use]
pub fn encode_trie_blob(prefixes: &[&str]) -> Vec<u8> {
    let empty = RawNode { zero: NO_NODE, one: NO_NODE, terminal: false, depth: 0 };
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
            let next = if next == NO_NODE {
                let idx = nodes.len() as u32;
                nodes.push(RawNode {
                    zero: NO_NODE,
                    one: NO_NODE,
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
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
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

/// Mounts bootstrap, config, trie-payload, and log-ingestion endpoints on
/// the mock server and returns a bootstrap token for it.
pub async fn mount_control_plane(
    server: &mut ServerGuard,
    purpose: &str,
    prefixes: &[&str],
) -> String {
    let bootstrap_body = serde_json::json!({
        "access_token": "test-access-token",
        "expires_in": 3600,
        "config_url": format!("{}/v1/edl/config", server.url()),
        "logs_url": format!("{}/v1/edl/logs", server.url()),
    });
    let _mock = server
        .mock("POST", "/api/v1/edl/bootstrap")
        .with_status(200)
        .with_body(bootstrap_body.to_string())
        .create_async()
        .await;

    let config_body = serde_json::json!({
        "deployment_id": "dep-test",
        "purpose": purpose,
        "update_frequency_seconds": 3600,
        "urls": { "combined": [format!("{}/edl.bin", server.url())] },
    });
    let _mock = server
        .mock("GET", "/v1/edl/config")
        .with_status(200)
        .with_body(config_body.to_string())
        .create_async()
        .await;

    let _mock = server
        .mock("GET", "/edl.bin")
        .with_status(200)
        .with_body(encode_trie_blob(prefixes))
        .create_async()
        .await;

    bootstrap_token(&server.url(), "dep-test")
}
