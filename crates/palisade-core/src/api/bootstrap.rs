//! Bootstrap client: exchanges the long-lived bootstrap token for a
//! short-lived access token and the per-tenant data-plane URLs.

use std::time::Duration;

use super::{
    classify_failure, ApiError, BootstrapRequest, BootstrapResponse, COMPONENT_TYPE,
    COMPONENT_VERSION,
};

/// Path appended to the token issuer to form the bootstrap URL.
const BOOTSTRAP_PATH: &str = "/api/v1/edl/bootstrap";

/// Scopes requested on every bootstrap.
const SCOPES: [&str; 2] = ["edl_config", "edl_logs"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the bootstrap endpoint.
pub struct BootstrapClient {
    http: reqwest::Client,
}

impl BootstrapClient {
    /// Creates a new bootstrap client.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client fails to build.
    pub fn new() -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }

    /// Performs the bootstrap call against `{issuer}/api/v1/edl/bootstrap`.
    ///
    /// The bootstrap token is relayed unmodified; the control plane is the
    /// trust anchor and validates it server-side.
    ///
    /// # Errors
    ///
    /// - [`ApiError::DeploymentDeleted`] on 410
    /// - [`ApiError::DeploymentDisabled`] on 403
    /// - [`ApiError::UnexpectedStatus`] on any other non-200 status
    /// - [`ApiError::Http`] on transport failures
    pub async fn bootstrap(
        &self,
        issuer: &str,
        bootstrap_token: &str,
        machine_id: &str,
    ) -> Result<BootstrapResponse, ApiError> {
        let url = format!("{}{}", issuer.trim_end_matches('/'), BOOTSTRAP_PATH);

        let request = BootstrapRequest {
            bootstrap_token: bootstrap_token.to_string(),
            component_type: COMPONENT_TYPE.to_string(),
            component_version: COMPONENT_VERSION.to_string(),
            machine_id: machine_id.to_string(),
            scopes: SCOPES.iter().map(ToString::to_string).collect(),
        };

        let response = self.http.post(&url).json(&request).send().await?;
        if response.status().as_u16() != 200 {
            return Err(classify_failure(response).await);
        }

        Ok(response.json().await?)
    }
}
