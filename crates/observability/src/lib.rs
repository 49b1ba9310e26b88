//! Process-wide tracing setup shared by the vault binaries.

pub mod tracing;

pub use crate::tracing::LogFormat;

/// Initialize tracing with JSON output, filtered by `RUST_LOG` (default `info`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(LogFormat::from_env());
}
