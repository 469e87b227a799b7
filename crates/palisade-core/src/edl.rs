//! Periodic EDL fetcher.
//!
//! Downloads the pre-computed trie payload on a configurable cadence and
//! swaps it into the matcher atomically. A failed refresh leaves the
//! previously loaded list serving; the error is recorded and retried on the
//! next tick.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::matcher::IpMatcher;
use crate::trie::{self, TrieLoadError};

/// Fallback cadence when the configuration carries none.
pub const DEFAULT_UPDATE_FREQUENCY: Duration = Duration::from_secs(300);

const FETCH_ATTEMPTS: u32 = 3;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// EDL fetch and load errors.
#[derive(Debug, Error)]
pub enum EdlError {
    #[error("EDL URL is empty")]
    EmptyUrl,

    #[error("EDL endpoint responded with status {status}: {body}")]
    FetchStatus { status: u16, body: String },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to load EDL trie: {0}")]
    Load(#[from] TrieLoadError),
}

struct UpdaterSettings {
    url: String,
    frequency: Duration,
}

/// Fetch bookkeeping, readable for telemetry.
#[derive(Debug, Clone, Default)]
pub struct UpdaterStatus {
    pub last_update: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub update_count: u64,
}

/// Fetches the EDL payload and publishes fresh tries into the matcher.
pub struct EdlUpdater {
    http: reqwest::Client,
    matcher: Arc<IpMatcher>,
    settings: RwLock<UpdaterSettings>,
    status: RwLock<UpdaterStatus>,
    reconfigured: Notify,
}

impl EdlUpdater {
    /// Creates an updater for `url` at the given cadence.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(
        url: String,
        frequency: Duration,
        matcher: Arc<IpMatcher>,
    ) -> Result<Self, EdlError> {
        // The payload is already compact; request it uncompressed.
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).no_gzip().build()?;
        Ok(Self {
            http,
            matcher,
            settings: RwLock::new(UpdaterSettings { url, frequency }),
            status: RwLock::new(UpdaterStatus::default()),
            reconfigured: Notify::new(),
        })
    }

    /// Performs the initial fetch. A failure here fails initialization
    /// upward; the update loop is never entered.
    ///
    /// # Errors
    ///
    /// Returns [`EdlError::EmptyUrl`] for a missing URL or the error from
    /// the initial fetch.
    pub async fn start(&self) -> Result<(), EdlError> {
        if self.settings.read().url.is_empty() {
            return Err(EdlError::EmptyUrl);
        }

        debug!("loading initial EDL data");
        self.update_now().await
    }

    /// Runs the periodic update loop until the shutdown signal fires.
    ///
    /// A reconfiguration notification tears down the inner ticker and
    /// recreates it with the new cadence; the reconfigure path triggers its
    /// own immediate fetch, so no data is missed in between.
    pub async fn run_update_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let frequency = self.settings.read().frequency;
            let mut ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + frequency,
                frequency,
            );

            loop {
                tokio::select! {
                    _ = shutdown.recv() => return,
                    () = self.reconfigured.notified() => {
                        trace!("EDL updater reconfiguring with new settings");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.update_now().await {
                            error!(error = %err, "EDL update failed");
                        }
                    }
                }
            }
        }
    }

    /// Fetches, loads, and publishes the list immediately.
    ///
    /// # Errors
    ///
    /// Returns the final fetch error after exhausting retries; the matcher
    /// keeps serving the previous trie.
    pub async fn update_now(&self) -> Result<(), EdlError> {
        let started = std::time::Instant::now();

        let (new_trie, entries) = match self.fetch_with_retry().await {
            Ok(loaded) => loaded,
            Err(err) => {
                self.status.write().last_error = Some(err.to_string());
                return Err(err);
            }
        };

        self.matcher.update(new_trie, entries);

        {
            let mut status = self.status.write();
            status.last_update = Some(Utc::now());
            status.last_error = None;
            status.update_count += 1;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if entries == 0 {
            info!(elapsed_ms, "EDL updated with empty list");
        } else {
            info!(elapsed_ms, approx_entries = entries, "EDL loaded");
        }
        Ok(())
    }

    async fn fetch_with_retry(&self) -> Result<(trie::IpTrie, u64), EdlError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.fetch().await {
                Ok(loaded) => return Ok(loaded),
                Err(err) => {
                    warn!(
                        attempt,
                        max_attempts = FETCH_ATTEMPTS,
                        error = %err,
                        "EDL fetch attempt failed"
                    );
                    if attempt >= FETCH_ATTEMPTS {
                        return Err(err);
                    }
                    tokio::time::sleep(Duration::from_secs(u64::from(attempt) * 2)).await;
                }
            }
        }
    }

    async fn fetch(&self) -> Result<(trie::IpTrie, u64), EdlError> {
        let url = self.settings.read().url.clone();

        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if status.as_u16() != 200 {
            let bytes = response.bytes().await.unwrap_or_default();
            let body = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).into_owned();
            return Err(EdlError::FetchStatus { status: status.as_u16(), body });
        }

        let payload = response.bytes().await?;
        let (new_trie, entries) = trie::load(Cursor::new(payload))?;
        if entries == 0 {
            warn!("EDL is empty, no IP prefixes loaded");
        }
        Ok((new_trie, entries))
    }

    /// Applies a new URL and cadence, restarts the loop's ticker, and kicks
    /// off an immediate out-of-band fetch.
    pub fn reconfigure(self: &Arc<Self>, url: String, frequency: Duration) {
        {
            let mut settings = self.settings.write();
            settings.url = url;
            settings.frequency = frequency;
        }
        self.reconfigured.notify_one();

        let updater = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = updater.update_now().await {
                error!(error = %err, "EDL update after reconfiguration failed");
            }
        });
    }

    /// Current fetch bookkeeping.
    #[must_use]
    pub fn status(&self) -> UpdaterStatus {
        self.status.read().clone()
    }
}
