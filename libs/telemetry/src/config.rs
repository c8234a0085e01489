use std::env;

pub const DEFAULT_FILTER: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub json_logs: bool,
    /// Fallback directive when `RUST_LOG` is unset or invalid.
    pub filter: String,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            json_logs: false,
            filter: DEFAULT_FILTER.to_string(),
        }
    }

    pub fn with_json_logs(mut self, json_logs: bool) -> Self {
        self.json_logs = json_logs;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = filter.into();
        self
    }

    pub fn from_env(default_service_name: &str) -> Self {
        Self::from_lookup(default_service_name, |name| env::var(name).ok())
    }

    /// `AGENTS_SERVICE_NAME` overrides the name, `AGENTS_JSON_LOGS` or
    /// `LOG_FORMAT=json` switch to JSON output.
    pub fn from_lookup(
        default_service_name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let service_name = lookup("AGENTS_SERVICE_NAME")
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| default_service_name.to_string());
        let json_logs = lookup("AGENTS_JSON_LOGS")
            .map(|value| is_truthy(&value))
            .or_else(|| lookup("LOG_FORMAT").map(|value| value.eq_ignore_ascii_case("json")))
            .unwrap_or(false);
        Self::new(service_name).with_json_logs(json_logs)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
