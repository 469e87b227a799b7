//! Process-wide lifecycle owner.
//!
//! The host proxy may install the middleware on many routes, but the
//! control-plane resources (token, EDL, event shipper) are shared, so the
//! manager is a singleton with once-only initialization: the first
//! [`initialize`] call runs to completion and every later call observes the
//! cached result. Per-route state lives on the middleware wrapper, not here.
//!
//! The fail-open policy is enforced at this level: whenever the EDL
//! subsystem is absent or degraded, [`Manager::is_ip_allowed`] answers
//! `true` and traffic flows.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, OnceCell};
use tracing::{debug, error, info, trace, warn};

use crate::api::{ApiError, ConfigClient, EdlConfig};
use crate::config::{IpStrategy, MiddlewareConfig};
use crate::edl::{EdlError, EdlUpdater, UpdaterStatus, DEFAULT_UPDATE_FREQUENCY};
use crate::events::{
    BatchMetadata, BlockEvent, EventShipper, ShipperConfig, ShipperError, TokenSource,
};
use crate::matcher::IpMatcher;
use crate::token::{self, TokenError, TokenManager};
use crate::util;

/// Cadence of the supervisor that retries a temporarily disabled deployment.
pub const DISABLED_RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// Errors that fail middleware initialization.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("bootstrap token is required")]
    MissingBootstrapToken,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Edl(#[from] EdlError),

    #[error(transparent)]
    Shipper(#[from] ShipperError),
}

/// The request-path error: the extracted client IP did not parse.
#[derive(Debug, Error)]
#[error("invalid client IP address {ip:?}")]
pub struct InvalidIpError {
    pub ip: String,
}

/// List interpretation in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdlMode {
    /// Membership in the list means the request is allowed.
    Allowlist,
    /// Membership in the list means the request is blocked.
    Blocklist,
}

impl EdlMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowlist => "allowlist",
            Self::Blocklist => "blocklist",
        }
    }

    /// Maps the configuration `purpose` to a mode. `other` and `others` are
    /// observed synonyms for blocklist; anything unrecognized collapses to
    /// blocklist as well.
    #[must_use]
    pub fn from_purpose(purpose: &str) -> Self {
        match purpose {
            "allowlist" => Self::Allowlist,
            _ => Self::Blocklist,
        }
    }
}

struct ManagerState {
    deployment_enabled: bool,
    temporarily_disabled: bool,
    disabled_check_at: Instant,
    mode: EdlMode,
    edl_url: String,
    update_frequency: Duration,
    disabled_retry_active: bool,
    token_refresh_active: bool,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            deployment_enabled: false,
            temporarily_disabled: false,
            disabled_check_at: Instant::now(),
            mode: EdlMode::Blocklist,
            edl_url: String::new(),
            update_frequency: DEFAULT_UPDATE_FREQUENCY,
            disabled_retry_active: false,
            token_refresh_active: false,
        }
    }
}

/// Lifecycle owner for the EDL subsystem.
pub struct Manager {
    token_manager: Arc<TokenManager>,
    config_client: ConfigClient,
    matcher: Arc<IpMatcher>,
    shipper: Option<Arc<EventShipper>>,
    updater: RwLock<Option<Arc<EdlUpdater>>>,
    state: RwLock<ManagerState>,
    device_id: String,
    deployment_id: String,
    shutdown_tx: broadcast::Sender<()>,
}

static INSTANCE: OnceCell<Result<Arc<Manager>, Arc<InitError>>> = OnceCell::const_new();

/// Initializes the process-wide manager once; concurrent and subsequent
/// calls observe the first call's result.
///
/// # Errors
///
/// Returns the (cached) initialization error; the middleware must not be
/// installed when this fails.
pub async fn initialize(config: &MiddlewareConfig) -> Result<Arc<Manager>, Arc<InitError>> {
    INSTANCE
        .get_or_init(|| async { Manager::connect(config).await.map_err(Arc::new) })
        .await
        .clone()
}

/// Returns the process-wide manager, if initialization has succeeded.
#[must_use]
pub fn global() -> Option<Arc<Manager>> {
    INSTANCE.get().and_then(|result| result.as_ref().ok().cloned())
}

impl Manager {
    /// Constructs an independent manager: validates the bootstrap token,
    /// bootstraps against the control plane, starts the event shipper and
    /// EDL updater, and spawns the background refresh loops.
    ///
    /// [`initialize`] wraps this constructor with the process-wide
    /// singleton; embedders and tests may call it directly.
    ///
    /// # Errors
    ///
    /// Configuration errors (missing/malformed token, wrong component type)
    /// and unrecoverable control-plane failures fail initialization. A 410
    /// or 403 from the control plane instead yields a pass-through manager
    /// in the corresponding degraded state.
    pub async fn connect(config: &MiddlewareConfig) -> Result<Arc<Self>, InitError> {
        if config.bootstrap_token.is_empty() {
            return Err(InitError::MissingBootstrapToken);
        }

        let claims = token::decode_claims(&config.bootstrap_token)?;
        claims.validate()?;

        let device_id = if config.machine_id.is_empty() {
            let id = util::generate_machine_id();
            info!(machine_id = %id, "generated random machine id");
            id
        } else {
            info!(machine_id = %config.machine_id, "using provided machine id");
            config.machine_id.clone()
        };

        let token_manager = Arc::new(TokenManager::new(
            config.bootstrap_token.clone(),
            claims.iss.clone(),
            device_id.clone(),
        )?);

        if !claims.deployment_id.is_empty() {
            info!(deployment_id = %claims.deployment_id, "initializing palisade middleware");
        }

        let mut initial_state = ManagerState::default();
        let mut bootstrap_ok = false;
        let mut schedule_disabled_retry = false;
        match token_manager.authenticate().await {
            Ok(()) => {
                bootstrap_ok = true;
                initial_state.deployment_enabled = true;
            }
            Err(err) if err.is_permanent() => {
                info!("deployment deleted (410), running in allow-all mode");
            }
            Err(err) if err.is_temporarily_disabled() => {
                initial_state.temporarily_disabled = true;
                initial_state.disabled_check_at = Instant::now() + DISABLED_RETRY_INTERVAL;
                schedule_disabled_retry = true;
                info!("deployment temporarily disabled (403), running in allow-all mode");
            }
            Err(err) => return Err(err.into()),
        }

        let logs_url = TokenSource::logs_url(token_manager.as_ref());
        let shipper = if logs_url.is_empty() {
            trace!("no logs URL available, event shipper not started");
            None
        } else {
            debug!(logs_url = %logs_url, "starting event shipper");
            let shipper = Arc::new(EventShipper::new(
                Arc::clone(&token_manager) as Arc<dyn TokenSource>,
                batch_metadata(&device_id, config),
                ShipperConfig::default(),
            )?);
            shipper.start();
            Some(shipper)
        };

        let (shutdown_tx, _) = broadcast::channel(4);
        let manager = Arc::new(Self {
            token_manager,
            config_client: ConfigClient::new()?,
            matcher: Arc::new(IpMatcher::new()),
            shipper,
            updater: RwLock::new(None),
            state: RwLock::new(initial_state),
            device_id,
            deployment_id: claims.deployment_id,
            shutdown_tx,
        });

        if bootstrap_ok {
            manager.setup_edl().await?;
        }
        if schedule_disabled_retry {
            manager.spawn_disabled_retry();
        }

        debug!(
            deployment_enabled = manager.is_deployment_enabled(),
            "manager initialization complete"
        );
        Ok(manager)
    }

    /// Fetches the EDL configuration and, when usable, brings up the
    /// updater and the background loops. An unusable configuration leaves
    /// the deployment disabled (pass-through).
    async fn setup_edl(self: &Arc<Self>) -> Result<(), InitError> {
        let edl_config = match self.fetch_edl_config().await {
            Ok(config) => Some(config),
            Err(err) if err.is_permanent() => {
                self.state.write().deployment_enabled = false;
                info!("deployment deleted while fetching config");
                None
            }
            Err(err) if err.is_temporarily_disabled() => {
                {
                    let mut state = self.state.write();
                    state.temporarily_disabled = true;
                    state.disabled_check_at = Instant::now() + DISABLED_RETRY_INTERVAL;
                }
                info!("deployment temporarily disabled while fetching config");
                self.spawn_disabled_retry();
                None
            }
            Err(err) => return Err(err.into()),
        };

        let url = edl_config.as_ref().and_then(|config| config.urls.combined.first().cloned());
        let (Some(edl_config), Some(url)) = (edl_config, url) else {
            // The config is a no-op trigger without a source URL.
            self.state.write().deployment_enabled = false;
            return Ok(());
        };

        let frequency = normalize_frequency(edl_config.update_frequency_seconds);
        let mode = EdlMode::from_purpose(&edl_config.purpose);
        {
            let mut state = self.state.write();
            state.mode = mode;
            state.edl_url = url.clone();
            state.update_frequency = frequency;
        }

        let updater = Arc::new(EdlUpdater::new(url, frequency, Arc::clone(&self.matcher))?);
        debug!(deployment_id = %self.deployment_id, "starting EDL updater");
        updater.start().await?;
        *self.updater.write() = Some(Arc::clone(&updater));

        self.spawn_token_refresh();
        tokio::spawn(updater.run_update_loop(self.shutdown_tx.subscribe()));
        Ok(())
    }

    async fn fetch_edl_config(&self) -> Result<EdlConfig, ApiError> {
        let config_url = self.token_manager.config_url();
        trace!(config_url = %config_url, "fetching EDL config");

        let config = self
            .config_client
            .get_edl_config(&config_url, &self.token_manager.access_token())
            .await?;

        info!(
            deployment_id = %self.deployment_id,
            purpose = %config.purpose,
            "fetched EDL configuration"
        );
        Ok(config)
    }

    /// Whether requests are currently subject to EDL decisions.
    #[must_use]
    pub fn is_deployment_enabled(&self) -> bool {
        let state = self.state.read();
        state.deployment_enabled && !state.temporarily_disabled
    }

    /// Decides whether the client IP may proceed.
    ///
    /// A disabled deployment allows everything. In blocklist mode presence
    /// in the list denies; in allowlist mode presence allows.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidIpError`] when `client_ip` does not parse; the
    /// dispatcher maps this to a 400 response.
    pub fn is_ip_allowed(&self, client_ip: &str) -> Result<bool, InvalidIpError> {
        if !self.is_deployment_enabled() {
            return Ok(true);
        }

        let addr: IpAddr = client_ip
            .parse()
            .map_err(|_| InvalidIpError { ip: client_ip.to_string() })?;
        let in_list = self.matcher.contains_addr(addr);
        let blocklist = self.state.read().mode == EdlMode::Blocklist;
        Ok(blocklist != in_list)
    }

    /// The list interpretation currently in effect.
    #[must_use]
    pub fn mode(&self) -> EdlMode {
        self.state.read().mode
    }

    /// Identifier of this process toward the control plane.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Deployment id from the bootstrap token (may be empty).
    #[must_use]
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Current EDL fetch bookkeeping, when an updater exists.
    #[must_use]
    pub fn edl_status(&self) -> Option<UpdaterStatus> {
        self.updater.read().as_ref().map(|updater| updater.status())
    }

    /// Approximate entry count of the active list (telemetry only).
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.matcher.entry_count()
    }

    /// `(shipped, dropped)` event counts, when a shipper is configured.
    #[must_use]
    pub fn shipper_stats(&self) -> Option<(u64, u64)> {
        self.shipper.as_ref().map(|shipper| shipper.stats())
    }

    /// Hands a block event to the shipper, fire-and-forget.
    pub fn send_block_event(&self, event: BlockEvent) {
        if let Some(shipper) = &self.shipper {
            trace!(
                ip = %event.client.ip,
                direct_ip = %event.client.direct_ip,
                "queueing block event"
            );
            shipper.send(event);
        } else {
            trace!("event shipper not configured, dropping block event");
        }
    }

    /// Re-fetches the EDL configuration and applies URL, frequency, and
    /// mode changes. Invoked after every successful token refresh, so the
    /// access token is always fresh enough for the refreshed config URL.
    pub async fn check_config_updates(self: &Arc<Self>) {
        if !self.is_deployment_enabled() {
            return;
        }
        if self.token_manager.config_url().is_empty() {
            return;
        }

        let edl_config = match self.fetch_edl_config().await {
            Ok(config) => config,
            Err(err) if err.is_permanent() => {
                self.state.write().deployment_enabled = false;
                info!("deployment deleted during config check");
                return;
            }
            Err(err) if err.is_temporarily_disabled() => {
                {
                    let mut state = self.state.write();
                    state.temporarily_disabled = true;
                    state.disabled_check_at = Instant::now() + DISABLED_RETRY_INTERVAL;
                }
                info!("deployment temporarily disabled during config check");
                self.spawn_disabled_retry();
                return;
            }
            // Keep using the current configuration.
            Err(err) => {
                error!(error = %err, "failed to fetch EDL config");
                return;
            }
        };

        let Some(new_url) = edl_config.urls.combined.first().cloned() else {
            return;
        };
        let new_frequency = normalize_frequency(edl_config.update_frequency_seconds);
        let new_mode = EdlMode::from_purpose(&edl_config.purpose);

        let changed = {
            let mut state = self.state.write();
            let url_changed = state.edl_url != new_url;
            let frequency_changed = state.update_frequency != new_frequency;
            let mode_changed = state.mode != new_mode;

            if url_changed {
                info!(old = %state.edl_url, new = %new_url, "EDL URL changed");
            }
            if frequency_changed {
                info!(
                    old_secs = state.update_frequency.as_secs(),
                    new_secs = new_frequency.as_secs(),
                    "EDL update frequency changed"
                );
            }
            if mode_changed {
                info!(old = state.mode.as_str(), new = new_mode.as_str(), "EDL mode changed");
            }

            state.edl_url = new_url.clone();
            state.update_frequency = new_frequency;
            state.mode = new_mode;
            url_changed || frequency_changed || mode_changed
        };
        if !changed {
            return;
        }

        let updater = self.updater.read().clone();
        if let Some(updater) = updater {
            updater.reconfigure(new_url, new_frequency);
        }
    }

    /// Spawns the token-refresh loop (idempotent).
    fn spawn_token_refresh(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if state.token_refresh_active {
                return;
            }
            state.token_refresh_active = true;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut delay = manager.token_manager.refresh_interval();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    () = tokio::time::sleep(delay) => {
                        if !manager.token_manager.is_deployment_active() {
                            info!("stopping token refresh, deployment deleted");
                            break;
                        }
                        match manager.token_manager.authenticate().await {
                            Ok(()) => {
                                trace!("access token refreshed");
                                manager.check_config_updates().await;
                                delay = manager.token_manager.refresh_interval();
                            }
                            Err(err) => {
                                warn!(error = %err, "token refresh failed");
                                delay = token::REFRESH_RETRY_BACKOFF;
                            }
                        }
                    }
                }
            }
            manager.state.write().token_refresh_active = false;
        });
    }

    /// Spawns the supervisor that periodically re-bootstraps a temporarily
    /// disabled deployment (idempotent).
    fn spawn_disabled_retry(self: &Arc<Self>) {
        {
            let mut state = self.state.write();
            if state.disabled_retry_active {
                return;
            }
            state.disabled_retry_active = true;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + DISABLED_RETRY_INTERVAL,
                DISABLED_RETRY_INTERVAL,
            );
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        let due = {
                            let state = manager.state.read();
                            state.temporarily_disabled
                                && Instant::now() >= state.disabled_check_at
                        };
                        if !due {
                            continue;
                        }

                        info!("checking whether deployment is re-enabled");
                        match manager.token_manager.authenticate().await {
                            Ok(()) => {
                                {
                                    let mut state = manager.state.write();
                                    state.temporarily_disabled = false;
                                    state.deployment_enabled = true;
                                }
                                info!("deployment re-enabled");
                                manager.resume_edl().await;
                                break;
                            }
                            Err(err) if err.is_permanent() => {
                                {
                                    let mut state = manager.state.write();
                                    state.temporarily_disabled = false;
                                    state.deployment_enabled = false;
                                }
                                info!("deployment deleted (410) during retry");
                                break;
                            }
                            Err(err) if err.is_temporarily_disabled() => {
                                manager.state.write().disabled_check_at =
                                    Instant::now() + DISABLED_RETRY_INTERVAL;
                                trace!("deployment still disabled, will retry");
                            }
                            Err(err) => {
                                manager.state.write().disabled_check_at =
                                    Instant::now() + DISABLED_RETRY_INTERVAL;
                                error!(error = %err, "deployment status check failed, will retry");
                            }
                        }
                    }
                }
            }
            manager.state.write().disabled_retry_active = false;
        });
    }

    /// Re-runs EDL setup after a disabled deployment recovered.
    async fn resume_edl(self: &Arc<Self>) {
        let edl_config = match self.fetch_edl_config().await {
            Ok(config) => config,
            Err(err) => {
                error!(error = %err, "failed to fetch EDL config after re-enable");
                return;
            }
        };
        let Some(url) = edl_config.urls.combined.first().cloned() else {
            return;
        };

        let frequency = normalize_frequency(edl_config.update_frequency_seconds);
        {
            let mut state = self.state.write();
            state.mode = EdlMode::from_purpose(&edl_config.purpose);
            state.edl_url = url.clone();
            state.update_frequency = frequency;
        }

        let existing = self.updater.read().clone();
        if let Some(updater) = existing {
            updater.reconfigure(url, frequency);
        } else {
            let updater = match EdlUpdater::new(url, frequency, Arc::clone(&self.matcher)) {
                Ok(updater) => Arc::new(updater),
                Err(err) => {
                    error!(error = %err, "failed to construct EDL updater");
                    return;
                }
            };
            if let Err(err) = updater.start().await {
                error!(error = %err, "initial EDL fetch after re-enable failed");
                return;
            }
            *self.updater.write() = Some(Arc::clone(&updater));
            tokio::spawn(updater.run_update_loop(self.shutdown_tx.subscribe()));
        }

        self.spawn_token_refresh();
    }

    /// Stops all background tasks and flushes the event shipper.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        if let Some(shipper) = &self.shipper {
            if let Err(err) = shipper.stop().await {
                error!(error = %err, "error stopping event shipper");
            }
        }
    }
}

/// `update_frequency_seconds <= 0` falls back to the 5-minute default.
fn normalize_frequency(seconds: i64) -> Duration {
    if seconds <= 0 {
        DEFAULT_UPDATE_FREQUENCY
    } else {
        Duration::from_secs(seconds as u64)
    }
}

fn batch_metadata(device_id: &str, config: &MiddlewareConfig) -> BatchMetadata {
    BatchMetadata {
        device_id: device_id.to_string(),
        ip_strategy: config.ip_strategy.as_str().to_string(),
        trusted_header: (config.ip_strategy == IpStrategy::Custom
            && !config.trusted_header.is_empty())
        .then(|| config.trusted_header.clone()),
        trusted_proxies: (!config.trusted_proxies.is_empty())
            .then(|| config.trusted_proxies.clone()),
    }
}
