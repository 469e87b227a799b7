//! # Palisade Core
//!
//! Core library for the Palisade EDL enforcement middleware.
//!
//! Palisade consumes an External Dynamic List (EDL) — a remotely managed set
//! of IP prefixes — and decides per request whether the client IP may proceed
//! to the upstream handler. Blocked requests are reported asynchronously as
//! structured events.
//!
//! This crate provides:
//!
//! - **[`trie`]**: bit-wise binary trie over IPv4/IPv6 prefixes backed by a
//!   single flat node arena, plus the loader for the pre-computed binary
//!   wire format.
//!
//! - **[`matcher`]**: the current trie under a lock-free atomic handle,
//!   replaced wholesale on every EDL refresh.
//!
//! - **[`api`]**: control-plane HTTP clients (bootstrap and EDL
//!   configuration) and the shared error taxonomy.
//!
//! - **[`token`]**: bootstrap-token decoding and short-lived access-token
//!   refresh scheduling.
//!
//! - **[`edl`]**: the periodic EDL fetcher that swaps fresh tries into the
//!   matcher.
//!
//! - **[`events`]**: bounded buffering, batching, rate limiting, and
//!   shipment of block events to the log-ingestion endpoint.
//!
//! - **[`manager`]**: the process-wide lifecycle owner tying the above
//!   together with at-most-once initialization.
//!
//! ## Data Flow
//!
//! ```text
//! bootstrap token ──► TokenManager ──► control plane
//!                          │   (access token, config URL, logs URL)
//!                          ▼
//!                       Manager ──► EdlUpdater ──► IpMatcher (ArcSwap)
//!                          │                            ▲
//!                          ▼                            │ per-request lookup
//!                     EventShipper ◄── block events ◄── dispatcher
//! ```
//!
//! The per-request path (`IpMatcher` lookup and event enqueue) is
//! non-blocking; everything that touches the network runs on background
//! tasks coordinated by a shutdown broadcast.

pub mod api;
pub mod config;
pub mod edl;
pub mod events;
pub mod logging;
pub mod manager;
pub mod matcher;
pub mod token;
pub mod trie;
pub mod util;

#[cfg(test)]
pub(crate) mod testsupport;
