//! # Telemetry
//!
//! Tracing bootstrap for txmq services. Every protocol log line carries the
//! checkback id, so a single id can be followed from the bridge through the
//! broker to the daemon.
//!
//! ## Usage
//!
//! ```rust
//! use txmq_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let _guard = init_telemetry(&TelemetryConfig::default());
//! ```

use tracing_subscriber::EnvFilter;

/// Configuration for telemetry initialization.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name reported on log lines.
    pub service_name: String,
    /// Default log level filter, overridable via `RUST_LOG`.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "txmq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Guard kept alive for the lifetime of the subscriber.
pub struct TelemetryGuard;

impl TelemetryGuard {
    /// Shut down telemetry.
    pub fn shutdown(self) {}
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; subsequent calls keep the first subscriber.
pub fn init_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();

    tracing::debug!(service = %config.service_name, "telemetry initialized");
    TelemetryGuard
}
