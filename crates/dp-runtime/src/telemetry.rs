//! Tracing setup for embedders.
//!
//! The transport binary calls this once at startup. The filter comes
//! from `DP_LOG` (standard `EnvFilter` syntax); credentials never
//! appear in fields, so the JSON output is safe to ship to a collector.

use tracing_subscriber::EnvFilter;

/// Initialize structured logging. Safe to call once per process;
/// returns false when a subscriber was already installed.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_env("DP_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info,dp_runtime=debug"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .try_init()
        .is_ok()
}
