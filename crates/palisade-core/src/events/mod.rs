//! Block events and the pipeline that ships them.
//!
//! Events are owned values that move from the request path through a bounded
//! ingress channel (and, on overflow, a ring buffer) into batches posted to
//! the log-ingestion endpoint. Delivery is best-effort and unordered.

mod bucket;
mod buffer;
mod shipper;

pub use bucket::TokenBucket;
pub use buffer::RingBuffer;
pub use shipper::{
    BatchMetadata, EventShipper, ShipperConfig, ShipperError, TokenSource,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type tag carried by every blocked-access event.
pub const EVENT_TYPE_ACCESS_BLOCKED: &str = "access_blocked";

/// A blocked-access event as shipped to the log endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEvent {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub request: RequestDetails,
    pub client: ClientInfo,
    pub policy: PolicyInfo,
    pub status_code: u16,
}

/// Details of the blocked request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDetails {
    pub method: String,
    pub host: String,
    pub path: String,
    pub scheme: String,
}

/// Client addressing: the IP that was checked and the direct peer address
/// (kept separately to debug proxy-header issues).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip: String,
    pub direct_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

/// Policy in effect when the request was blocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// `"allowlist"` or `"blocklist"`.
    pub mode: String,
}

impl BlockEvent {
    /// Creates a blocked-access event stamped with the current time.
    #[must_use]
    pub fn new(request: RequestDetails, client: ClientInfo, mode: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type: EVENT_TYPE_ACCESS_BLOCKED.to_string(),
            request,
            client,
            policy: PolicyInfo { mode: mode.to_string() },
            status_code: 403,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_event(ip: &str) -> BlockEvent {
    BlockEvent::new(
        RequestDetails {
            method: "GET".into(),
            host: "example.com".into(),
            path: "/".into(),
            scheme: "http".into(),
        },
        ClientInfo { ip: ip.into(), direct_ip: ip.into(), user_agent: String::new() },
        "blocklist",
    )
}
