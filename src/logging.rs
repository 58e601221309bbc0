//! # Structured Logging Module
//!
//! Environment-aware structured logging for debugging async batch runs.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration.
///
/// Respects `MURAL_LOG` (falling back to `RUST_LOG`, then `info`) for the
/// filter directive. Safe to call more than once; only the first call
/// installs a subscriber.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let filter = std::env::var("MURAL_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        let subscriber = tracing_subscriber::registry().with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_filter(EnvFilter::new(filter)),
        );

        // A subscriber may already be installed by the embedding process.
        let _ = subscriber.try_init();
    });
}
