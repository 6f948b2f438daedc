//! Tracing and logging (shared setup).

use fitswap_infra::LoggingConfig;

/// Initialize process-wide observability from configuration.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(config: &LoggingConfig) {
    tracing::init(config);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
