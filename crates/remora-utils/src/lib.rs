//! # Remora Utilities
//!
//! Host-side helpers for programs embedding `remora-core`.
//!
//! The core library only emits `tracing` events; this crate installs a subscriber for them
//! (console, JSON, rolling log files) so every host gets the same log output.

pub mod logging;

// Re-export commonly used logging functions for convenience
pub use logging::{
    init_logging, init_logging_file_only, init_logging_with_level, LogFormat, LogLevel, LogSettings, LoggingError,
    LoggingGuard,
};
pub use tracing::{debug, error, info, trace, warn};
