//! Logging bootstrap for test binaries and scenario runners.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter directive.
pub const LOG_ENV_VAR: &str = "TRIALKIT_LOG";

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

/// Initialize tracing with the TRIALKIT_LOG environment variable.
///
/// Defaults to "info" level if TRIALKIT_LOG is not set. Panics if a global
/// subscriber is already installed; use [`try_init_tracing`] from tests.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Like [`init_tracing`], but a no-op when a subscriber is already installed.
///
/// Returns true if this call installed the subscriber.
pub fn try_init_tracing() -> bool {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init()
        .is_ok()
}
