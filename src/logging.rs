// src/logging.rs

//! Installs the `tracing` subscriber used by applications embedding the client.

use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, Registry, filter::LevelFilter, prelude::*, reload};

pub type ReloadHandle = reload::Handle<EnvFilter, Registry>;

/// Sets up a compact formatter behind a reloadable filter.
///
/// `RUST_LOG` takes precedence over `level`. The returned handle lets callers
/// change the filter at runtime, e.g. after reloading configuration.
pub fn init(level: &str) -> Result<ReloadHandle> {
    let filter = std::env::var("RUST_LOG")
        .ok()
        .and_then(|v| EnvFilter::try_new(v).ok())
        .unwrap_or_else(|| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .parse_lossy(level)
        });
    let (filter, reload_handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().compact().with_ansi(true))
        .try_init()
        .map_err(|e| anyhow!("Failed to install tracing subscriber: {e}"))?;

    Ok(reload_handle)
}

/// Replaces the active filter with one parsed from `level`.
pub fn set_level(handle: &ReloadHandle, level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level)?;
    handle
        .reload(filter)
        .map_err(|e| anyhow!("Failed to reload log filter: {e}"))
}
