//! Tracing initialization shared by the binary and integration tests.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the global subscriber. `RUST_LOG` wins over the configured
/// default filter. Safe to call once per process.
pub fn init(default_filter: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
