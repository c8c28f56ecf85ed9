//! Tracing subscriber setup for embedding processes

use crate::error::{ExportError, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber filtered by `RUST_LOG`, falling back to
/// `default_level`. Fails if a subscriber is already installed.
pub fn try_init_logging(default_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| ExportError::config(format!("logging: {}", e)))
}
