//! Tracing initialization for embedders and tests.
//!
//! Drover logs through `tracing` everywhere; installing a subscriber is the
//! embedder's call. This helper sets up an env-filtered fmt subscriber
//! (`RUST_LOG` controls verbosity, default `info`).

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the default subscriber, ignoring failure if one exists already.
pub fn init() {
    let _ = try_init();
}

pub fn try_init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))
}
