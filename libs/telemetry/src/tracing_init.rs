use std::sync::OnceLock;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::layer::Layer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::TelemetryConfig;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops, and a subscriber
/// installed by someone else (e.g. a test harness) is left in place.
pub fn init_telemetry(cfg: TelemetryConfig) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let fmt_layer = if cfg.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let env_filter = env_filter(&cfg);

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_ok();

    INIT.set(()).ok();
    if installed {
        info!(service = %cfg.service_name, json = cfg.json_logs, "telemetry initialised");
    }
    Ok(())
}

pub fn is_initialised() -> bool {
    INIT.get().is_some()
}

fn env_filter(cfg: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.filter))
        .unwrap_or_else(|_| EnvFilter::new(crate::config::DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_a_no_op() {
        init_telemetry(TelemetryConfig::new("first")).unwrap();
        assert!(is_initialised());
        init_telemetry(TelemetryConfig::new("second").with_json_logs(true)).unwrap();
        assert!(is_initialised());
    }

    #[test]
    fn invalid_fallback_filter_degrades_to_info() {
        let cfg = TelemetryConfig::new("svc").with_filter("=[not a directive");
        let filter = env_filter(&cfg);
        assert!(!filter.to_string().is_empty());
    }
}
