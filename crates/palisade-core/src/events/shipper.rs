//! Batching event shipper with bounded buffering, rate limiting, and retry.
//!
//! Two stages protect the request path: a bounded ingress channel accepts
//! events without blocking, spilling to the ring buffer when full. A worker
//! task drains the channel into batches and ships them, gated by a token
//! bucket. Failed batches return to the buffer rather than being discarded;
//! only buffer overflow drops events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use super::{BlockEvent, RingBuffer, TokenBucket};

const DEFAULT_BATCH_SIZE: usize = 1000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_BUCKET_CAPACITY: u64 = 10_000;
const DEFAULT_REFILL_RATE: u64 = 100;
const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Capacity of the non-blocking ingress channel.
const INGRESS_CAPACITY: usize = 1000;

const SHIP_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Provides the current access token and logs URL for shipments.
///
/// Implemented by the token manager; kept as a trait so the shipper can be
/// exercised against a mock in tests.
pub trait TokenSource: Send + Sync {
    fn access_token(&self) -> String;
    fn logs_url(&self) -> String;
}

/// Shipper errors.
#[derive(Debug, Error)]
pub enum ShipperError {
    #[error("logs URL not available")]
    MissingLogsUrl,

    #[error("access token not available")]
    MissingToken,

    #[error("log endpoint responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("timed out waiting for event shipper to stop")]
    ShutdownTimeout,
}

/// Tuning knobs for the shipper; zero values fall back to the defaults.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub bucket_capacity: u64,
    pub refill_rate: u64,
    pub buffer_size: usize,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            refill_rate: DEFAULT_REFILL_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl ShipperConfig {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if self.batch_size == 0 {
            self.batch_size = defaults.batch_size;
        }
        if self.flush_interval.is_zero() {
            self.flush_interval = defaults.flush_interval;
        }
        if self.bucket_capacity == 0 {
            self.bucket_capacity = defaults.bucket_capacity;
        }
        if self.refill_rate == 0 {
            self.refill_rate = defaults.refill_rate;
        }
        if self.buffer_size == 0 {
            self.buffer_size = defaults.buffer_size;
        }
        self
    }
}

/// Middleware-configuration metadata attached to every batch.
///
/// Set once at manager initialization and never mutated afterwards.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetadata {
    pub device_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ip_strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_proxies: Option<Vec<String>>,
}

#[derive(Serialize)]
struct BatchPayload<'a> {
    batch_metadata: &'a BatchMetadata,
    events: &'a [BlockEvent],
}

struct ShipperInner {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    bucket: TokenBucket,
    buffer: RingBuffer,
    metadata: BatchMetadata,
    batch_size: usize,
    flush_interval: Duration,
    shipped: AtomicU64,
    dropped: AtomicU64,
}

/// Batching, rate-limited shipper for block events.
pub struct EventShipper {
    inner: Arc<ShipperInner>,
    tx: mpsc::Sender<BlockEvent>,
    rx: Mutex<Option<mpsc::Receiver<BlockEvent>>>,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventShipper {
    /// Creates a shipper; call [`start`](Self::start) to begin processing.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client fails to build.
    pub fn new(
        tokens: Arc<dyn TokenSource>,
        metadata: BatchMetadata,
        config: ShipperConfig,
    ) -> Result<Self, ShipperError> {
        let config = config.normalized();
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let (tx, rx) = mpsc::channel(INGRESS_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            inner: Arc::new(ShipperInner {
                http,
                tokens,
                bucket: TokenBucket::new(config.bucket_capacity, config.refill_rate),
                buffer: RingBuffer::new(config.buffer_size),
                metadata,
                batch_size: config.batch_size,
                flush_interval: config.flush_interval,
                shipped: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
            tx,
            rx: Mutex::new(Some(rx)),
            shutdown_tx,
            worker: Mutex::new(None),
        })
    }

    /// Starts the worker task. Calling `start` more than once is a no-op.
    pub fn start(&self) {
        let Some(rx) = self.rx.lock().take() else {
            return;
        };
        trace!("starting event shipper");
        let handle =
            tokio::spawn(worker_loop(Arc::clone(&self.inner), rx, self.shutdown_tx.subscribe()));
        *self.worker.lock() = Some(handle);
    }

    /// Enqueues an event without blocking.
    ///
    /// A full ingress channel spills to the ring buffer; a full ring buffer
    /// overwrites its oldest entry and the overwrite is counted as a drop.
    pub fn send(&self, event: BlockEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                if self.inner.buffer.push(event) {
                    let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(total_dropped = dropped, "event dropped, overflow buffer full");
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                trace!("event shipper stopped, discarding event");
            }
        }
    }

    /// Stops the worker: drains the ingress channel into a final batch,
    /// flushes remaining buffered events, and gives up after a 5-second
    /// grace period.
    ///
    /// # Errors
    ///
    /// Returns [`ShipperError::ShutdownTimeout`] when the worker does not
    /// finish in time; unflushed events are abandoned.
    pub async fn stop(&self) -> Result<(), ShipperError> {
        let _ = self.shutdown_tx.send(());
        let handle = self.worker.lock().take();

        if let Some(handle) = handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(joined) => {
                    if let Err(err) = joined {
                        error!(error = %err, "event shipper worker failed");
                    }
                }
                Err(_) => return Err(ShipperError::ShutdownTimeout),
            }
        }

        flush_buffer(&self.inner).await;
        Ok(())
    }

    /// Returns `(shipped, dropped)` event counts.
    #[must_use]
    pub fn stats(&self) -> (u64, u64) {
        (self.inner.shipped.load(Ordering::Relaxed), self.inner.dropped.load(Ordering::Relaxed))
    }
}

async fn worker_loop(
    inner: Arc<ShipperInner>,
    mut rx: mpsc::Receiver<BlockEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    trace!(
        batch_size = inner.batch_size,
        flush_interval_secs = inner.flush_interval.as_secs(),
        "event shipper worker started"
    );

    let mut flush = tokio::time::interval_at(
        tokio::time::Instant::now() + inner.flush_interval,
        inner.flush_interval,
    );
    let mut batch: Vec<BlockEvent> = Vec::with_capacity(inner.batch_size);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                // Final drain of whatever is already queued.
                while let Ok(event) = rx.try_recv() {
                    batch.push(event);
                    if batch.len() >= inner.batch_size {
                        ship_batch(&inner, &mut batch).await;
                    }
                }
                ship_batch(&inner, &mut batch).await;
                return;
            }
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= inner.batch_size {
                            ship_batch(&inner, &mut batch).await;
                        }
                    }
                    None => {
                        ship_batch(&inner, &mut batch).await;
                        return;
                    }
                }
            }
            _ = flush.tick() => {
                ship_batch(&inner, &mut batch).await;
                let buffered = inner.buffer.drain(inner.batch_size);
                ship_events(&inner, buffered).await;
            }
        }
    }
}

/// Ships the accumulated batch, leaving its capacity in place for reuse.
async fn ship_batch(inner: &ShipperInner, batch: &mut Vec<BlockEvent>) {
    if batch.is_empty() {
        return;
    }
    let events: Vec<BlockEvent> = batch.drain(..).collect();
    ship_events(inner, events).await;
}

async fn ship_events(inner: &ShipperInner, events: Vec<BlockEvent>) {
    if events.is_empty() {
        return;
    }
    trace!(count = events.len(), "shipping event batch");

    let wait = inner.bucket.wait_time(1);
    if !wait.is_zero() {
        trace!(wait_ms = wait.as_millis() as u64, "rate limited, waiting");
        tokio::time::sleep(wait).await;
    }
    if !inner.bucket.allow(1) {
        warn!(count = events.len(), "rate limited, re-buffering events");
        rebuffer(inner, events);
        return;
    }

    let payload = BatchPayload { batch_metadata: &inner.metadata, events: &events };
    let body = match serde_json::to_vec(&payload) {
        Ok(body) => body,
        Err(err) => {
            error!(error = %err, "failed to serialize event batch");
            inner.dropped.fetch_add(events.len() as u64, Ordering::Relaxed);
            return;
        }
    };

    match send_with_retry(inner, &body).await {
        Ok(()) => {
            let total = inner.shipped.fetch_add(events.len() as u64, Ordering::Relaxed)
                + events.len() as u64;
            debug!(count = events.len(), total_shipped = total, "shipped event batch");
        }
        Err(err) => {
            warn!(count = events.len(), error = %err, "failed to ship event batch");
            rebuffer(inner, events);
        }
    }
}

fn rebuffer(inner: &ShipperInner, events: Vec<BlockEvent>) {
    for event in events {
        if inner.buffer.push(event) {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn send_with_retry(inner: &ShipperInner, body: &[u8]) -> Result<(), ShipperError> {
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match send(inner, body.to_vec()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                if attempt >= SHIP_ATTEMPTS {
                    return Err(err);
                }
                debug!(attempt, error = %err, "event shipment attempt failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn send(inner: &ShipperInner, body: Vec<u8>) -> Result<(), ShipperError> {
    let logs_url = inner.tokens.logs_url();
    if logs_url.is_empty() {
        return Err(ShipperError::MissingLogsUrl);
    }
    let token = inner.tokens.access_token();
    if token.is_empty() {
        return Err(ShipperError::MissingToken);
    }

    let response = inner
        .http
        .post(&logs_url)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .bearer_auth(token)
        .body(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let bytes = response.bytes().await.unwrap_or_default();
    let body = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]).into_owned();
    Err(ShipperError::Status { status: status.as_u16(), body })
}

/// Ships everything left in the ring buffer in batch-sized chunks.
async fn flush_buffer(inner: &ShipperInner) {
    let mut events = inner.buffer.drain_all();
    while !events.is_empty() {
        let rest = events.split_off(events.len().min(inner.batch_size));
        ship_events(inner, events).await;
        events = rest;
    }
}
