//! Shared utilities for Parley: wire protocol, logging, error types.
//!
//! This crate provides the hub protocol spoken between `parley-gateway` and
//! `parley-client`, plus common infrastructure used by both.

#![forbid(unsafe_code)]

pub mod error;
pub mod helpers;
pub mod protocol;

pub use error::{Error, Result};
pub use protocol::*;

/// Initialize tracing with a default filter.
///
/// `RUST_LOG` overrides `default_filter` when set.
pub fn init_tracing_with_default(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
