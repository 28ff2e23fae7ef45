//! Tracing setup for processes embedding the cache.
//!
//! The installed filter is reloadable, so the cache's own verbosity can be
//! raised while diagnosing a remote outage without a restart.

use std::sync::OnceLock;
use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Filter directives giving this crate its own level on top of `base`.
pub fn cache_directives(base: &str, cache: &str) -> String {
    format!("{base},{}={cache}", env!("CARGO_CRATE_NAME"))
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install a fmt subscriber filtered by `RUST_LOG`, or by `level` when unset.
///
/// Only the first call installs anything; returns whether this one did.
pub fn init_tracing_with_level(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter_layer, handle) = reload::Layer::new(filter);
    if FILTER_HANDLE.set(handle).is_err() {
        return false;
    }

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}

/// Replace the active filter. Returns `false` if tracing was not installed
/// through this module.
pub fn apply_logging_level(directives: &str) -> bool {
    let Some(handle) = FILTER_HANDLE.get() else {
        return false;
    };
    handle
        .modify(|filter| *filter = EnvFilter::new(directives))
        .is_ok()
}
