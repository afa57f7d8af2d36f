// Telemetry Module
//
// Console tracing setup shared by every Direktiv app (flow, sidecar, init).
// - Filter comes from RUST_LOG / LOG_LEVEL, with a per-app default
// - DIREKTIV_LOG_JSON switches the console layer to JSON lines

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

// ============================================================================
// Well-known span and field names
// ============================================================================

/// Field names used consistently across crates so log queries stay stable.
pub mod fields {
    pub const NAMESPACE: &str = "namespace";
    pub const INSTANCE_ID: &str = "instance_id";
    pub const WORKFLOW_PATH: &str = "workflow_path";
    pub const STATE_ID: &str = "state";
    pub const ACTION_ID: &str = "action_id";
    pub const NODE: &str = "node";
}

// ============================================================================
// Telemetry Configuration
// ============================================================================

/// Configuration for console tracing
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Service version
    pub service_version: Option<String>,
    /// Log filter (e.g., "info", "debug", "direktiv_engine=debug")
    pub log_filter: Option<String>,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
    /// Whether to include the target module in every line
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "direktiv".to_string(),
            service_version: None,
            log_filter: None,
            json: false,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DIREKTIV_SERVICE_NAME`: Service name (default: "direktiv")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `DIREKTIV_LOG_JSON`: "true" to emit JSON lines
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("DIREKTIV_SERVICE_NAME")
                .unwrap_or_else(|_| "direktiv".to_string()),
            service_version: None,
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            json: std::env::var("DIREKTIV_LOG_JSON")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            with_target: true,
        }
    }

    /// Use the given filter unless one came from the environment
    pub fn with_default_filter(mut self, filter: &str) -> Self {
        if self.log_filter.is_none() {
            self.log_filter = Some(filter.to_string());
        }
        self
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }
}

// ============================================================================
// Initialization
// ============================================================================

/// Build the filter for a config, falling back to `info` on parse errors
pub fn build_filter(config: &TelemetryConfig) -> EnvFilter {
    config
        .log_filter
        .as_ref()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Initialize the global tracing subscriber
///
/// Safe to call once per process. A second call is ignored (the first
/// subscriber stays installed), which keeps tests that share a process happy.
///
/// # Example
///
/// ```ignore
/// use direktiv_core::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env().with_default_filter("direktiv=info"));
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) {
    let filter = build_filter(&config);

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(config.with_target)
            .with_filter(filter)
            .boxed()
    };

    if tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_err()
    {
        return;
    }

    tracing::info!(
        service = %config.service_name,
        version = config.service_version.as_deref().unwrap_or("dev"),
        "telemetry initialized"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "direktiv");
        assert!(config.log_filter.is_none());
        assert!(!config.json);
    }

    #[test]
    fn test_default_filter_only_applies_when_unset() {
        let config = TelemetryConfig::default().with_default_filter("direktiv=debug");
        assert_eq!(config.log_filter.as_deref(), Some("direktiv=debug"));

        let config = TelemetryConfig {
            log_filter: Some("warn".to_string()),
            ..Default::default()
        }
        .with_default_filter("direktiv=debug");
        assert_eq!(config.log_filter.as_deref(), Some("warn"));
    }

    #[test]
    fn test_invalid_filter_falls_back() {
        let config = TelemetryConfig {
            log_filter: Some("[[[".to_string()),
            ..Default::default()
        };
        // Must not panic
        let _ = build_filter(&config);
    }
}
