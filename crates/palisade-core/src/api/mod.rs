//! Control-plane HTTP surface: bootstrap and EDL-configuration clients,
//! wire types, and the shared error taxonomy.
//!
//! Status-code contract (shared by both endpoints): `410` means the
//! deployment was permanently deleted, `403` means it is temporarily
//! disabled, anything else non-successful is an opaque failure. Error bodies
//! are captured up to 1 KiB for context.

mod bootstrap;
mod config;

pub use bootstrap::BootstrapClient;
pub use config::ConfigClient;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Component identity sent on bootstrap; a control-plane contract value.
pub const COMPONENT_TYPE: &str = "ellio_traefik_middleware_plugin";

/// Component version sent on bootstrap.
pub const COMPONENT_VERSION: &str = "1.0.0";

/// Maximum number of response-body bytes carried inside error messages.
const BODY_SNIPPET_LIMIT: usize = 1024;

/// Errors returned by control-plane calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The control plane returned 410: the deployment no longer exists.
    /// Permanent; callers must stop retrying.
    #[error("deployment permanently deleted")]
    DeploymentDeleted,

    /// The control plane returned 403: the deployment is administratively
    /// disabled but may come back. Callers retry on a slow cadence.
    #[error("deployment temporarily disabled: {0}")]
    DeploymentDisabled(String),

    /// Any other non-success status.
    #[error("control plane responded with status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },

    /// Transport-level failure from the HTTP client.
    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ApiError {
    /// Returns `true` if the deployment is gone for good (410).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::DeploymentDeleted)
    }

    /// Returns `true` if the deployment is temporarily disabled (403).
    #[must_use]
    pub fn is_temporarily_disabled(&self) -> bool {
        matches!(self, Self::DeploymentDisabled(_))
    }
}

/// Request body for `POST {issuer}/api/v1/edl/bootstrap`.
#[derive(Debug, Serialize)]
pub struct BootstrapRequest {
    pub bootstrap_token: String,
    pub component_type: String,
    pub component_version: String,
    pub machine_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Successful bootstrap response.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapResponse {
    pub access_token: String,
    /// Access-token lifetime in seconds.
    pub expires_in: u64,
    pub config_url: String,
    #[serde(default)]
    pub logs_url: String,
}

/// EDL configuration returned by the config endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdlConfig {
    #[serde(default)]
    pub deployment_id: String,
    /// `allowlist` selects allowlist mode; `blocklist`, `other`, and
    /// `others` all mean blocklist.
    #[serde(default)]
    pub purpose: String,
    #[serde(default)]
    pub direction: String,
    #[serde(default)]
    pub update_frequency_seconds: i64,
    #[serde(default)]
    pub firewall_format: String,
    #[serde(default)]
    pub urls: EdlUrls,
}

/// EDL source URLs; the first combined URL is the trie payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EdlUrls {
    #[serde(default)]
    pub combined: Vec<String>,
}

/// Maps a non-success control-plane response to the error taxonomy.
async fn classify_failure(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = body_snippet(response).await;
    match status {
        410 => ApiError::DeploymentDeleted,
        403 => ApiError::DeploymentDisabled(body),
        _ => ApiError::UnexpectedStatus { status, body },
    }
}

/// Reads at most [`BODY_SNIPPET_LIMIT`] bytes of the response body for error
/// context, tolerating read failures.
async fn body_snippet(response: reqwest::Response) -> String {
    let bytes = response.bytes().await.unwrap_or_default();
    String::from_utf8_lossy(&bytes[..bytes.len().min(BODY_SNIPPET_LIMIT)]).into_owned()
}
