// Process configuration loaded from environment variables.
// Decision: One flat struct read once at startup; components receive the pieces they need
// Decision: Absent DATABASE_URL selects in-memory stores (single node development)

use std::time::Duration;

/// Which main entry the binary runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppKind {
    /// Engine, API, gateway, bus and reconciler
    #[default]
    Flow,
    /// Command executor sidecar inside action pods
    Sidecar,
    /// Copies the binary into a shared volume for action containers
    Init,
}

impl AppKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "flow" => Some(AppKind::Flow),
            "sidecar" => Some(AppKind::Sidecar),
            "init" => Some(AppKind::Init),
            _ => None,
        }
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppKind::Flow => write!(f, "flow"),
            AppKind::Sidecar => write!(f, "sidecar"),
            AppKind::Init => write!(f, "init"),
        }
    }
}

/// Functions runtime back-end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FunctionsBackend {
    Knative,
    Docker,
    /// No external runtime; services are tracked in memory only
    #[default]
    Memory,
}

impl FunctionsBackend {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "knative" => FunctionsBackend::Knative,
            "docker" => FunctionsBackend::Docker,
            _ => FunctionsBackend::Memory,
        }
    }
}

/// Cluster bus ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusPorts {
    /// Message daemon port (peer message exchange)
    pub daemon: u16,
    /// Admin port of the message daemon (readiness)
    pub daemon_admin: u16,
    /// Directory (lookup) service port
    pub lookup: u16,
    /// Admin port of the directory service
    pub lookup_admin: u16,
}

impl Default for BusPorts {
    fn default() -> Self {
        Self {
            daemon: 4150,
            daemon_admin: 4151,
            lookup: 4160,
            lookup_admin: 4161,
        }
    }
}

/// Complete process configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub app: AppKind,
    /// Optional token required on /api/* (except /api/v2/status)
    pub api_key: Option<String>,
    pub api_port: u16,
    pub sidecar_port: u16,
    /// Log sink for the sidecar
    pub http_backend: Option<String>,
    /// Disables remote log posting
    pub dev_mode: bool,
    /// Kubernetes namespace used for node discovery
    pub kube_namespace: Option<String>,
    /// Leader identity
    pub pod_name: String,
    pub database_url: Option<String>,
    pub bus_ports: BusPorts,
    /// Static peer list for the bus finder
    pub bus_peers: Vec<String>,
    /// DNS service name for the bus finder
    pub bus_service: Option<String>,
    pub functions_backend: FunctionsBackend,
    pub knative_namespace: String,
    pub kube_api: String,
    pub docker_host: String,
    /// Single cap applied to variable writes and reads
    pub max_variable_size: usize,
    pub engine_workers: usize,
    pub reconcile_interval: Duration,
    pub init_target: String,
    /// Key for secrets at rest, format "key_id:base64_key"
    pub secrets_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app: AppKind::Flow,
            api_key: None,
            api_port: 6665,
            sidecar_port: 8890,
            http_backend: None,
            dev_mode: false,
            kube_namespace: None,
            pod_name: "direktiv-local".to_string(),
            database_url: None,
            bus_ports: BusPorts::default(),
            bus_peers: vec![],
            bus_service: None,
            functions_backend: FunctionsBackend::Memory,
            knative_namespace: "direktiv-services-direktiv".to_string(),
            kube_api: "https://kubernetes.default.svc".to_string(),
            docker_host: "http://127.0.0.1:2375".to_string(),
            max_variable_size: 32 * 1024 * 1024,
            engine_workers: 8,
            reconcile_interval: Duration::from_secs(30),
            init_target: "/usr/share/direktiv/direktiv-cmd".to_string(),
            secrets_key: None,
        }
    }
}

/// Error reading configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

impl Config {
    /// Load `.env` (if present) and read the environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let app = match non_empty("DIREKTIV_APP") {
            Some(v) => AppKind::parse(&v).ok_or(ConfigError::InvalidValue {
                name: "DIREKTIV_APP",
                value: v,
            })?,
            None => AppKind::Flow,
        };

        let bus_ports = BusPorts {
            daemon: parse_or(&non_empty, "DIREKTIV_BUS_PORT", defaults.bus_ports.daemon)?,
            daemon_admin: parse_or(
                &non_empty,
                "DIREKTIV_BUS_ADMIN_PORT",
                defaults.bus_ports.daemon_admin,
            )?,
            lookup: parse_or(
                &non_empty,
                "DIREKTIV_BUS_LOOKUP_PORT",
                defaults.bus_ports.lookup,
            )?,
            lookup_admin: parse_or(
                &non_empty,
                "DIREKTIV_BUS_LOOKUP_ADMIN_PORT",
                defaults.bus_ports.lookup_admin,
            )?,
        };

        Ok(Self {
            app,
            api_key: non_empty("DIREKTIV_API_KEY"),
            api_port: parse_or(&non_empty, "DIREKTIV_API_PORT", defaults.api_port)?,
            sidecar_port: parse_or(&non_empty, "DIREKTIV_SIDECAR_PORT", defaults.sidecar_port)?,
            http_backend: non_empty("DIREKTIV_HTTP_BACKEND"),
            dev_mode: non_empty("DIREKTIV_DEV_MODE")
                .map(|v| is_truthy(&v))
                .unwrap_or(false),
            kube_namespace: non_empty("DIREKTIV_NAMESPACE"),
            pod_name: non_empty("POD_NAME").unwrap_or(defaults.pod_name),
            database_url: non_empty("DATABASE_URL"),
            bus_ports,
            bus_peers: non_empty("DIREKTIV_BUS_PEERS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            bus_service: non_empty("DIREKTIV_BUS_SERVICE"),
            functions_backend: non_empty("DIREKTIV_FUNCTIONS_BACKEND")
                .map(|v| FunctionsBackend::parse(&v))
                .unwrap_or_default(),
            knative_namespace: non_empty("DIREKTIV_KNATIVE_NAMESPACE")
                .unwrap_or(defaults.knative_namespace),
            kube_api: non_empty("DIREKTIV_KUBE_API").unwrap_or(defaults.kube_api),
            docker_host: non_empty("DIREKTIV_DOCKER_HOST").unwrap_or(defaults.docker_host),
            max_variable_size: parse_or(
                &non_empty,
                "DIREKTIV_MAX_VARIABLE_SIZE",
                defaults.max_variable_size,
            )?,
            engine_workers: parse_or(&non_empty, "DIREKTIV_ENGINE_WORKERS", defaults.engine_workers)?
                .max(1),
            reconcile_interval: Duration::from_secs(parse_or(
                &non_empty,
                "DIREKTIV_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval.as_secs(),
            )?),
            init_target: non_empty("DIREKTIV_INIT_TARGET").unwrap_or(defaults.init_target),
            secrets_key: non_empty("DIREKTIV_SECRETS_KEY"),
        })
    }
}

fn parse_or<T, F>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { name, value: v }),
        None => Ok(default),
    }
}

fn is_truthy(v: &str) -> bool {
    matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.app, AppKind::Flow);
        assert_eq!(config.api_port, 6665);
        assert_eq!(config.bus_ports, BusPorts::default());
        assert!(config.api_key.is_none());
        assert!(!config.dev_mode);
        assert_eq!(config.functions_backend, FunctionsBackend::Memory);
    }

    #[test]
    fn test_app_selection() {
        let config = Config::from_lookup(lookup(&[("DIREKTIV_APP", "sidecar")])).unwrap();
        assert_eq!(config.app, AppKind::Sidecar);

        let config = Config::from_lookup(lookup(&[("DIREKTIV_APP", "INIT")])).unwrap();
        assert_eq!(config.app, AppKind::Init);

        let err = Config::from_lookup(lookup(&[("DIREKTIV_APP", "ui")])).unwrap_err();
        assert!(err.to_string().contains("DIREKTIV_APP"));
    }

    #[test]
    fn test_dev_mode_and_backend() {
        let config = Config::from_lookup(lookup(&[
            ("DIREKTIV_DEV_MODE", "true"),
            ("DIREKTIV_HTTP_BACKEND", "http://flow:6665"),
            ("POD_NAME", "flow-0"),
        ]))
        .unwrap();
        assert!(config.dev_mode);
        assert_eq!(config.http_backend.as_deref(), Some("http://flow:6665"));
        assert_eq!(config.pod_name, "flow-0");
    }

    #[test]
    fn test_peer_list_parsing() {
        let config = Config::from_lookup(lookup(&[(
            "DIREKTIV_BUS_PEERS",
            "10.0.0.1:4150, 10.0.0.2:4150,,",
        )]))
        .unwrap();
        assert_eq!(config.bus_peers, vec!["10.0.0.1:4150", "10.0.0.2:4150"]);
    }

    #[test]
    fn test_invalid_port() {
        let err = Config::from_lookup(lookup(&[("DIREKTIV_API_PORT", "nope")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "DIREKTIV_API_PORT",
                ..
            }
        ));
    }

    #[test]
    fn test_workers_never_zero() {
        let config = Config::from_lookup(lookup(&[("DIREKTIV_ENGINE_WORKERS", "0")])).unwrap();
        assert_eq!(config.engine_workers, 1);
    }
}
