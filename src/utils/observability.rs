// src/utils/observability.rs
//! Tracing initialization shared by both binaries

use anyhow::Result;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `info` when unset. Safe to call from
/// tests, where a subscriber may already be installed.
pub fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    // A second init (tests) is not an error worth failing startup over
    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }

    Ok(())
}
