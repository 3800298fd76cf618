//! Shared utilities for the keel renderer core.
//!
//! This crate provides foundational types used by every other crate:
//! - Error types and result aliases
//! - Logging initialization
//! - Timer utilities
//! - Renderer configuration

mod config;
mod error;
mod logging;
mod timer;

pub use config::{RendererConfig, MAX_FRAMES_IN_FLIGHT};
pub use error::{Error, Result};
pub use logging::{init_logging, init_logging_with};
pub use timer::Timer;
