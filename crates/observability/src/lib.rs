//! Tracing/logging setup shared by the binaries.

/// Initialize process-wide logging with the defaults (JSON, `RUST_LOG` or `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    self::tracing::init_with(&LogConfig::default());
}

pub mod tracing;

pub use self::tracing::{LogConfig, LogFormat};
