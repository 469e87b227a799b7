//! Integration tests for the Palisade middleware.
//!
//! Each test wires a mock control plane (bootstrap, EDL configuration, trie
//! payload, log ingestion) with `mockito` and drives requests through an
//! axum router carrying the middleware.

pub mod support;

#[cfg(test)]
mod enforcement_tests;
