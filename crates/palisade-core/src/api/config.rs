//! EDL configuration client.
//!
//! The config URL is discovered via bootstrap and already carries the
//! complete path; this client only attaches the bearer token.

use std::time::Duration;

use super::{classify_failure, ApiError, EdlConfig};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the per-tenant EDL configuration endpoint.
pub struct ConfigClient {
    http: reqwest::Client,
}

impl ConfigClient {
    /// Creates a new config client.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying HTTP client fails to build.
    pub fn new() -> Result<Self, ApiError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self { http })
    }

    /// Fetches the EDL configuration from `config_url`.
    ///
    /// # Errors
    ///
    /// Same status mapping as the bootstrap call: 410 permanent, 403
    /// temporary, other non-200 opaque.
    pub async fn get_edl_config(
        &self,
        config_url: &str,
        access_token: &str,
    ) -> Result<EdlConfig, ApiError> {
        let response = self.http.get(config_url).bearer_auth(access_token).send().await?;
        if response.status().as_u16() != 200 {
            return Err(classify_failure(response).await);
        }

        Ok(response.json().await?)
    }
}
