//! Logging setup with `tracing` + `tracing-subscriber`.
//!
//! The level comes from the `BELLOWS_LOG` environment variable (standard
//! env-filter directives), defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Initialise the global subscriber. Safe to call more than once; only
/// the first call installs it.
pub fn init() {
    let filter = EnvFilter::try_from_env("BELLOWS_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .ok();
}
