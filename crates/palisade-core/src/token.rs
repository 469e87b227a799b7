//! Bootstrap-token handling and access-token lifecycle.
//!
//! The bootstrap token is a JWT whose payload names the control plane
//! (`iss`) and the component it was minted for. Only the payload is decoded
//! here; the signature is deliberately **not** verified — the token is an
//! opaque credential relayed unmodified to the control plane, which is the
//! trust anchor.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::api::{ApiError, BootstrapClient, COMPONENT_TYPE};
use crate::events::TokenSource;

/// Refresh at 80% of the remaining token lifetime.
const REFRESH_FRACTION: f64 = 0.8;

/// Never schedule a refresh sooner than this.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

/// Fixed backoff after a failed refresh.
pub const REFRESH_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Errors from bootstrap-token decoding and validation.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("bootstrap token is not a three-segment JWT")]
    MalformedJwt,

    #[error("failed to decode JWT payload: {0}")]
    PayloadDecode(#[from] base64::DecodeError),

    #[error("failed to parse JWT claims: {0}")]
    PayloadJson(#[from] serde_json::Error),

    #[error("bootstrap token missing issuer")]
    MissingIssuer,

    #[error("unexpected component_type {0:?} in bootstrap token")]
    WrongComponentType(String),
}

/// Claims carried by the bootstrap token payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapClaims {
    #[serde(default)]
    pub iss: String,
    #[serde(default)]
    pub component_type: String,
    #[serde(default)]
    pub deployment_id: String,
}

impl BootstrapClaims {
    /// Validates the claims required for initialization: a non-empty issuer
    /// (the bootstrap URL is derived from it) and the expected component
    /// type.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::MissingIssuer`] or
    /// [`TokenError::WrongComponentType`].
    pub fn validate(&self) -> Result<(), TokenError> {
        if self.iss.is_empty() {
            return Err(TokenError::MissingIssuer);
        }
        if self.component_type != COMPONENT_TYPE {
            return Err(TokenError::WrongComponentType(self.component_type.clone()));
        }
        Ok(())
    }
}

/// Decodes the payload segment of a bootstrap token without verifying the
/// signature.
///
/// # Errors
///
/// Returns a [`TokenError`] when the token is not a three-segment JWT or the
/// payload is not base64-url JSON.
pub fn decode_claims(token: &str) -> Result<BootstrapClaims, TokenError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_), None) => payload,
        _ => return Err(TokenError::MalformedJwt),
    };

    let bytes = URL_SAFE_NO_PAD.decode(payload)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[derive(Default)]
struct TokenState {
    access_token: String,
    expires_at: Option<Instant>,
    config_url: String,
    logs_url: String,
    deployment_deleted: bool,
}

/// Owns the access token and the URLs discovered via bootstrap.
///
/// The manager drives the refresh schedule; this type performs the calls and
/// holds the shared state behind a read/write lock.
pub struct TokenManager {
    client: BootstrapClient,
    bootstrap_token: String,
    issuer: String,
    machine_id: String,
    state: RwLock<TokenState>,
}

impl TokenManager {
    /// Creates a token manager for the given credential and issuer.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(
        bootstrap_token: String,
        issuer: String,
        machine_id: String,
    ) -> Result<Self, ApiError> {
        Ok(Self {
            client: BootstrapClient::new()?,
            bootstrap_token,
            issuer,
            machine_id,
            state: RwLock::new(TokenState::default()),
        })
    }

    /// Performs a bootstrap call and stores the resulting token and URLs.
    ///
    /// Used both for initial bootstrap and for every scheduled refresh. A
    /// 410 response marks the deployment as deleted before the error is
    /// propagated.
    ///
    /// # Errors
    ///
    /// Propagates the [`ApiError`] from the bootstrap call.
    pub async fn authenticate(&self) -> Result<(), ApiError> {
        let response = match self
            .client
            .bootstrap(&self.issuer, &self.bootstrap_token, &self.machine_id)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                if err.is_permanent() {
                    self.state.write().deployment_deleted = true;
                    info!("deployment permanently deleted (410), switching to allow-all mode");
                }
                return Err(err);
            }
        };

        let expires_in = Duration::from_secs(response.expires_in);
        {
            let mut state = self.state.write();
            state.access_token = response.access_token;
            state.expires_at = Some(Instant::now() + expires_in);
            state.config_url = response.config_url;
            state.logs_url = response.logs_url;
        }

        debug!(expires_in_secs = expires_in.as_secs(), "bootstrap successful");
        Ok(())
    }

    /// Computes the delay until the next refresh: 80% of the remaining token
    /// lifetime, clamped to a 30-second minimum.
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        let remaining = self
            .state
            .read()
            .expires_at
            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
            .unwrap_or_default();

        let refresh_at = remaining.mul_f64(REFRESH_FRACTION);
        refresh_at.max(MIN_REFRESH_INTERVAL)
    }

    /// Returns the current access token (empty before the first bootstrap).
    #[must_use]
    pub fn access_token(&self) -> String {
        self.state.read().access_token.clone()
    }

    /// Returns the config URL discovered via bootstrap.
    #[must_use]
    pub fn config_url(&self) -> String {
        self.state.read().config_url.clone()
    }

    /// Returns `false` once the control plane reported the deployment as
    /// permanently deleted.
    #[must_use]
    pub fn is_deployment_active(&self) -> bool {
        !self.state.read().deployment_deleted
    }
}

impl TokenSource for TokenManager {
    fn access_token(&self) -> String {
        TokenManager::access_token(self)
    }

    fn logs_url(&self) -> String {
        self.state.read().logs_url.clone()
    }
}
