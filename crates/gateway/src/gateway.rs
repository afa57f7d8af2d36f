// Gateway: routing table ownership and request dispatch
// Decision: Readers load the table once per request and keep it until the response is written
// Decision: The pipeline budget covers auth through outbound; the body read is outside it

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::body::Body;
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use direktiv_core::file::normalize_path;
use direktiv_core::FileKind;
use tracing::{debug, info, instrument, warn};

use crate::backend::GatewayBackend;
use crate::context::GatewayRequest;
use crate::error::{GatewayError, PluginError};
use crate::plugin::{PluginEnv, PluginRegistry};
use crate::table::{ConsumerInfo, Endpoint, NamespaceRoutes, RouteInfo, RouteTable};

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Namespace served under `/gw`; its targets may reach other namespaces
    pub system_namespace: String,
    /// Pipeline budget of endpoints that do not set `timeout`
    pub default_timeout: Duration,
    /// Largest request body read into memory
    pub max_body: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            system_namespace: "system".to_string(),
            default_timeout: Duration::from_secs(60),
            max_body: 32 * 1024 * 1024,
        }
    }
}

impl GatewayConfig {
    pub fn with_system_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.system_namespace = namespace.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }
}

pub struct Gateway {
    config: GatewayConfig,
    registry: PluginRegistry,
    backend: Arc<dyn GatewayBackend>,
    table: ArcSwap<RouteTable>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backend: Arc<dyn GatewayBackend>) -> Self {
        Self {
            config,
            registry: PluginRegistry::builtin(),
            backend,
            table: ArcSwap::from_pointee(RouteTable::default()),
        }
    }

    pub fn with_registry(mut self, registry: PluginRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    // ========================================================================
    // Table maintenance
    // ========================================================================

    /// Compile one namespace from raw `(path, yaml)` files
    pub fn build_namespace(
        &self,
        namespace: &str,
        endpoints: Vec<(String, Vec<u8>)>,
        consumers: Vec<(String, Vec<u8>)>,
    ) -> NamespaceRoutes {
        let env = PluginEnv {
            namespace: namespace.to_string(),
            system_namespace: self.config.system_namespace.clone(),
            endpoint: String::new(),
            backend: self.backend.clone(),
        };
        let compiled = endpoints
            .iter()
            .map(|(path, data)| {
                Endpoint::compile(path, data, &self.registry, &env, self.config.default_timeout)
            })
            .collect();
        NamespaceRoutes::new(compiled, consumers)
    }

    /// Swap in new routes for a namespace; in-flight requests keep the old table
    pub fn set_namespace(&self, namespace: &str, routes: NamespaceRoutes) {
        let routes = Arc::new(routes);
        self.table.rcu(|current| {
            let mut next = RouteTable::clone(current);
            next.namespaces.insert(namespace.to_string(), routes.clone());
            next
        });
    }

    pub fn remove_namespace(&self, namespace: &str) {
        self.table.rcu(|current| {
            let mut next = RouteTable::clone(current);
            next.namespaces.remove(namespace);
            next
        });
        debug!(%namespace, "gateway routes removed");
    }

    /// Recompile a namespace from its endpoint and consumer files
    #[instrument(skip(self))]
    pub async fn sync_namespace(&self, namespace: &str) -> Result<usize, PluginError> {
        let endpoints = self.backend.files(namespace, FileKind::Endpoint).await?;
        let consumers = self.backend.files(namespace, FileKind::Consumer).await?;
        let routes = self.build_namespace(
            namespace,
            endpoints.into_iter().map(|f| (f.path, f.data)).collect(),
            consumers.into_iter().map(|f| (f.path, f.data)).collect(),
        );
        let errored = routes.endpoints.iter().filter(|e| !e.errors.is_empty()).count();
        let count = routes.endpoints.len();
        if errored > 0 {
            warn!(%namespace, errored, "some gateway endpoints are misconfigured");
        }
        self.set_namespace(namespace, routes);
        info!(%namespace, endpoints = count, "gateway routes rebuilt");
        Ok(count)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn routes(&self, namespace: &str) -> Vec<RouteInfo> {
        let table = self.table.load();
        let Some(routes) = table.namespaces.get(namespace) else {
            return Vec::new();
        };
        let prefix = if namespace == self.config.system_namespace {
            "/gw".to_string()
        } else {
            format!("/ns/{namespace}")
        };
        routes
            .endpoints
            .iter()
            .map(|ep| RouteInfo {
                file_path: ep.file_path.clone(),
                path: ep.path.clone(),
                server_path: ep.path.as_ref().map(|p| format!("{prefix}{p}")),
                methods: ep.methods.iter().map(|m| m.to_string()).collect(),
                allow_anonymous: ep.allow_anonymous,
                timeout: ep.timeout.as_secs(),
                plugins: ep.plugins.clone(),
                errors: ep.errors.clone(),
            })
            .collect()
    }

    pub fn consumers(&self, namespace: &str) -> Vec<ConsumerInfo> {
        self.table
            .load()
            .namespaces
            .get(namespace)
            .map(|routes| routes.consumer_files.clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Read the body, then run the matched endpoint's chain
    pub async fn serve(
        &self,
        namespace: &str,
        method: Method,
        path: &str,
        headers: HeaderMap,
        query: Vec<(String, String)>,
        body: Body,
    ) -> Response {
        let body = match axum::body::to_bytes(body, self.config.max_body).await {
            Ok(bytes) => bytes,
            Err(e) => return GatewayError::Body(e.to_string()).into_response(),
        };
        match self.dispatch(namespace, method, path, headers, query, body).await {
            Ok(response) => response,
            Err(e) => e.into_response(),
        }
    }

    #[instrument(skip(self, headers, query, body))]
    pub async fn dispatch(
        &self,
        namespace: &str,
        method: Method,
        path: &str,
        headers: HeaderMap,
        query: Vec<(String, String)>,
        body: Bytes,
    ) -> Result<Response, GatewayError> {
        let path = normalize_path(path);
        let table = self.table.load_full();
        let routes = table
            .namespaces
            .get(namespace)
            .ok_or_else(|| GatewayError::NoRoute(path.clone()))?;
        let (endpoint, params) = routes
            .find(&path)
            .ok_or_else(|| GatewayError::NoRoute(path.clone()))?;

        let Some(chain) = &endpoint.chain else {
            return Err(GatewayError::Misconfigured {
                path: endpoint.file_path.clone(),
                errors: endpoint.errors.join("; "),
            });
        };
        if !endpoint.methods.contains(&method) {
            return Err(GatewayError::MethodNotAllowed(method.to_string()));
        }

        let mut req = GatewayRequest::new(namespace, method, path);
        req.headers = headers;
        req.query = query;
        req.params = params;
        req.body = body;
        req.consumers = routes.consumers.clone();

        let budget = endpoint.timeout;
        match tokio::time::timeout(budget, chain.run(endpoint.allow_anonymous, req)).await {
            Ok(Ok(response)) => Ok(response.into_response()),
            Ok(Err(e)) => {
                debug!(error = %e, "plugin chain failed");
                Ok(e.into_response())
            }
            Err(_) => Err(GatewayError::Timeout(budget.as_secs())),
        }
    }
}
