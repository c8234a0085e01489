//! Logging setup shared by agent hosts: an `EnvFilter` driven by `RUST_LOG`
//! and a plain or JSON `fmt` layer.

mod config;
mod tracing_init;

pub use config::{DEFAULT_FILTER, TelemetryConfig};
pub use tracing_init::{init_telemetry, is_initialised};

/// Installs the subscriber for `service_name` using environment overrides.
pub fn install(service_name: &str) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig::from_env(service_name))
}
