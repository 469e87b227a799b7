//! # Palisade axum middleware
//!
//! Embeds the Palisade EDL enforcement core into an axum/tower router.
//!
//! The middleware decides per request whether the client IP may proceed to
//! the downstream handler. Blocked requests receive a static 403 page and
//! emit a structured event; everything else passes through untouched. The
//! subsystem fails open: a missing manager, a deleted deployment, or a
//! degraded control plane all mean traffic flows.
//!
//! ```no_run
//! use axum::{middleware, routing::get, Router};
//! use palisade_core::config::MiddlewareConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = MiddlewareConfig {
//!     bootstrap_token: std::env::var("PALISADE_BOOTSTRAP_TOKEN")?,
//!     ..MiddlewareConfig::default()
//! };
//! let state = palisade_axum::install(&config).await.map_err(|err| err.to_string())?;
//!
//! let app: Router = Router::new()
//!     .route("/", get(|| async { "hello" }))
//!     .layer(middleware::from_fn_with_state(state, palisade_axum::edl_access));
//! # Ok(())
//! # }
//! ```

pub mod block_page;
pub mod client_ip;

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use ipnet::IpNet;
use tracing::{debug, error, trace};

use palisade_core::config::{IpStrategy, MiddlewareConfig};
use palisade_core::events::{BlockEvent, ClientInfo, RequestDetails};
use palisade_core::logging;
use palisade_core::manager::{self, InitError, Manager};

/// Per-route middleware state.
///
/// The manager is process-wide and shared; the extraction policy (strategy,
/// header, parsed trusted proxies) is local to the installing route.
#[derive(Clone)]
pub struct EdlState {
    manager: Option<Arc<Manager>>,
    strategy: IpStrategy,
    trusted_header: String,
    trusted_proxies: Arc<Vec<IpNet>>,
}

impl EdlState {
    /// Builds per-route state around an (optional) manager.
    #[must_use]
    pub fn new(manager: Option<Arc<Manager>>, config: &MiddlewareConfig) -> Self {
        let trusted_proxies = client_ip::parse_trusted_proxies(&config.trusted_proxies);
        if !trusted_proxies.is_empty() {
            debug!(count = trusted_proxies.len(), "parsed trusted proxy ranges");
        }
        Self {
            manager,
            strategy: config.ip_strategy,
            trusted_header: config.trusted_header.clone(),
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }
}

/// Initializes logging and the process-wide manager, returning the state to
/// install with `axum::middleware::from_fn_with_state`.
///
/// The first call performs the bootstrap; later calls (one per route) reuse
/// the shared manager and only differ in their extraction policy.
///
/// # Errors
///
/// Returns the initialization error when the configuration is unusable
/// (missing or malformed bootstrap token) or the control plane failed in a
/// non-degradable way. The middleware must not be installed in that case.
pub async fn install(config: &MiddlewareConfig) -> Result<EdlState, Arc<InitError>> {
    logging::init(&config.log_level);

    let manager = manager::initialize(config).await?;
    Ok(EdlState::new(Some(manager), config))
}

/// The request dispatcher: allow, block with a 403 page, or reject with a
/// 400 for undeterminable client IPs.
pub async fn edl_access(
    State(state): State<EdlState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(manager) = state.manager.as_ref() else {
        return run_downstream(request, next).await;
    };
    if !manager.is_deployment_enabled() {
        return run_downstream(request, next).await;
    }

    let Some(ConnectInfo(peer)) = connect_info else {
        debug!("no direct connection address available, returning 400");
        return (StatusCode::BAD_REQUEST, "Unable to determine client IP").into_response();
    };

    let client_ip = client_ip::extract_client_ip(
        state.strategy,
        &state.trusted_header,
        &state.trusted_proxies,
        peer.ip(),
        request.headers(),
    );
    trace!(client_ip = %client_ip, "extracted client IP");
    if client_ip.is_empty() {
        return (StatusCode::BAD_REQUEST, "Unable to determine client IP").into_response();
    }

    let allowed = match manager.is_ip_allowed(&client_ip) {
        Ok(allowed) => allowed,
        Err(err) => {
            debug!(error = %err, "IP validation failed, returning 400");
            return (StatusCode::BAD_REQUEST, "Invalid IP address").into_response();
        }
    };
    if allowed {
        return run_downstream(request, next).await;
    }

    debug!(client_ip = %client_ip, "request blocked, returning 403");
    let event = build_block_event(&request, &client_ip, peer, manager.mode().as_str());
    manager.send_block_event(event);
    block_page::block_page_response()
}

/// Runs the downstream handler, converting panics into a 500 so a broken
/// handler cannot take down the connection.
async fn run_downstream(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(_) => {
            error!("recovered from panic in downstream handler");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    }
}

fn build_block_event(
    request: &Request,
    client_ip: &str,
    peer: SocketAddr,
    mode: &str,
) -> BlockEvent {
    let headers = request.headers();

    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(ToString::to_string)
        .or_else(|| request.uri().authority().map(ToString::to_string))
        .unwrap_or_default();

    let forwarded_https = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
    let scheme =
        if request.uri().scheme_str() == Some("https") || forwarded_https { "https" } else { "http" };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    BlockEvent::new(
        RequestDetails {
            method: request.method().to_string(),
            host,
            path: request.uri().path().to_string(),
            scheme: scheme.to_string(),
        },
        ClientInfo {
            ip: client_ip.to_string(),
            direct_ip: peer.ip().to_string(),
            user_agent,
        },
        mode,
    )
}
