//! Logging initialization and configuration.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::error::{Error, Result};

/// Default filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,keel=debug,keel_rhi=debug,keel_renderer=debug";

/// Initialize the logging system with tracing.
///
/// This sets up tracing-subscriber with:
/// - Environment-based filtering (RUST_LOG)
/// - Target names and thread ids on every line
///
/// Calling it twice is harmless: the second subscriber is rejected and
/// the first one stays installed.
///
/// # Example
/// ```
/// keel_core::init_logging();
/// tracing::info!("Renderer initialized");
/// ```
pub fn init_logging() {
    let _ = init_logging_with(DEFAULT_FILTER);
}

/// Initialize logging with an explicit fallback filter directive.
///
/// `RUST_LOG` still takes precedence when it is set.
///
/// # Errors
///
/// Returns [`Error::Logging`] if a global subscriber is already installed.
pub fn init_logging_with(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))
}
