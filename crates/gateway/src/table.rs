// Compiled routing table
//
// A table is built from the endpoint and consumer files of each namespace and
// never mutated afterwards. Endpoints that fail to compile stay in the table
// with their errors so they can answer 5xx and show up in introspection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::http::Method;
use direktiv_core::file::normalize_path;
use direktiv_core::manifest::{ConsumerFile, EndpointFile, PluginsConfig};
use serde::Serialize;
use tracing::warn;

use crate::context::{Consumer, GatewayRequest, GatewayResponse};
use crate::error::PluginError;
use crate::plugin::{AuthPlugin, InboundPlugin, OutboundPlugin, PluginEnv, PluginRegistry, TargetPlugin};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param(String),
}

fn is_brace(c: char) -> bool {
    c == '{' || c == '}'
}

fn parse_segments(path: &str) -> Result<Vec<Segment>, String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some("") => Err(format!("empty path parameter in '{path}'")),
            Some(name) if name.contains(is_brace) => Err(format!("malformed path parameter '{s}'")),
            Some(name) => Ok(Segment::Param(name.to_string())),
            None if s.contains(is_brace) => Err(format!("malformed path segment '{s}'")),
            None => Ok(Segment::Literal(s.to_string())),
        })
        .collect()
}

/// The plugins of a healthy endpoint
pub(crate) struct Chain {
    auth: Vec<Arc<dyn AuthPlugin>>,
    inbound: Vec<Arc<dyn InboundPlugin>>,
    target: Arc<dyn TargetPlugin>,
    outbound: Vec<Arc<dyn OutboundPlugin>>,
}

impl Chain {
    fn build(registry: &PluginRegistry, plugins: &PluginsConfig, env: &PluginEnv) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();
        let mut keep = |result: Result<(), PluginError>| {
            if let Err(e) = result {
                errors.push(e.to_string());
            }
        };

        let mut auth = Vec::new();
        for config in &plugins.auth {
            keep(registry.build_auth(config, env).map(|p| auth.push(p)));
        }
        let mut inbound = Vec::new();
        for config in &plugins.inbound {
            keep(registry.build_inbound(config, env).map(|p| inbound.push(p)));
        }
        let mut target = None;
        match &plugins.target {
            Some(config) => keep(registry.build_target(config, env).map(|p| target = Some(p))),
            None => keep(Err(PluginError::config("target", "no target plugin configured"))),
        }
        let mut outbound = Vec::new();
        for config in &plugins.outbound {
            keep(registry.build_outbound(config, env).map(|p| outbound.push(p)));
        }

        match target {
            Some(target) if errors.is_empty() => Ok(Self {
                auth,
                inbound,
                target,
                outbound,
            }),
            _ => Err(errors),
        }
    }

    /// auth, anonymous check, inbound, target, outbound
    pub async fn run(
        &self,
        allow_anonymous: bool,
        mut req: GatewayRequest,
    ) -> Result<GatewayResponse, PluginError> {
        for plugin in &self.auth {
            plugin.authenticate(&mut req).await?;
        }
        if req.consumer.is_none() && !allow_anonymous {
            return Ok(GatewayResponse::error(
                axum::http::StatusCode::FORBIDDEN,
                "forbidden",
                "authentication failed",
            ));
        }
        for plugin in &self.inbound {
            if let Some(resp) = plugin.handle(&mut req).await? {
                return Ok(resp);
            }
        }
        let mut resp = self.target.serve(&req).await?;
        for plugin in &self.outbound {
            resp = plugin.handle(&req, resp).await?;
        }
        Ok(resp)
    }
}

/// One endpoint file after compilation
pub struct Endpoint {
    pub file_path: String,
    /// Normalized route path
    pub path: Option<String>,
    segments: Vec<Segment>,
    pub methods: Vec<Method>,
    pub allow_anonymous: bool,
    pub timeout: Duration,
    pub plugins: PluginsConfig,
    pub errors: Vec<String>,
    pub(crate) chain: Option<Chain>,
}

impl Endpoint {
    pub(crate) fn compile(
        file_path: &str,
        data: &[u8],
        registry: &PluginRegistry,
        env: &PluginEnv,
        default_timeout: Duration,
    ) -> Self {
        let mut endpoint = Endpoint {
            file_path: file_path.to_string(),
            path: None,
            segments: Vec::new(),
            methods: Vec::new(),
            allow_anonymous: false,
            timeout: default_timeout,
            plugins: PluginsConfig::default(),
            errors: Vec::new(),
            chain: None,
        };
        let file = match EndpointFile::from_yaml(data) {
            Ok(file) => file,
            Err(e) => {
                endpoint.errors.push(format!("invalid endpoint file: {e}"));
                return endpoint;
            }
        };

        endpoint.allow_anonymous = file.allow_anonymous;
        if file.timeout > 0 {
            endpoint.timeout = Duration::from_secs(file.timeout);
        }
        match file.path.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => match parse_segments(path) {
                Ok(segments) => {
                    endpoint.path = Some(normalize_path(path));
                    endpoint.segments = segments;
                }
                Err(e) => endpoint.errors.push(e),
            },
            None => endpoint.errors.push("no path configured".to_string()),
        }
        if file.methods.is_empty() {
            endpoint.errors.push("no methods configured".to_string());
        }
        for m in &file.methods {
            match Method::from_bytes(m.trim().to_ascii_uppercase().as_bytes()) {
                Ok(method) => endpoint.methods.push(method),
                Err(_) => endpoint.errors.push(format!("invalid method '{m}'")),
            }
        }

        let env = PluginEnv {
            endpoint: endpoint.path.clone().unwrap_or_else(|| file_path.to_string()),
            ..env.clone()
        };
        match Chain::build(registry, &file.plugins, &env) {
            Ok(chain) if endpoint.errors.is_empty() => endpoint.chain = Some(chain),
            Ok(_) => {}
            Err(errors) => endpoint.errors.extend(errors),
        }
        endpoint.plugins = file.plugins;
        endpoint
    }

    /// Path parameters when `segments` of a request path match this endpoint
    fn matches(&self, segments: &[&str]) -> Option<BTreeMap<String, String>> {
        if self.path.is_none() || segments.len() != self.segments.len() {
            return None;
        }
        let mut params = BTreeMap::new();
        for (pattern, actual) in self.segments.iter().zip(segments) {
            match pattern {
                Segment::Literal(lit) if lit.as_str() == *actual => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), actual.to_string());
                }
            }
        }
        Some(params)
    }

    fn literal_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Literal(_)))
            .count()
    }
}

/// Routes and consumers of one namespace
#[derive(Default)]
pub struct NamespaceRoutes {
    pub endpoints: Vec<Arc<Endpoint>>,
    pub consumers: Arc<Vec<Consumer>>,
    pub consumer_files: Vec<ConsumerInfo>,
}

impl NamespaceRoutes {
    pub(crate) fn new(mut endpoints: Vec<Endpoint>, consumers: Vec<(String, Vec<u8>)>) -> Self {
        endpoints.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        let mut seen: HashMap<Vec<Segment>, String> = HashMap::new();
        for ep in endpoints.iter_mut().filter(|ep| ep.path.is_some()) {
            // `{a}` and `{b}` in the same position collide
            let shape: Vec<Segment> = ep
                .segments
                .iter()
                .map(|s| match s {
                    Segment::Param(_) => Segment::Param(String::new()),
                    lit => lit.clone(),
                })
                .collect();
            if let Some(owner) = seen.get(&shape) {
                ep.errors.push(format!("path already used by {owner}"));
                ep.chain = None;
            } else {
                seen.insert(shape, ep.file_path.clone());
            }
        }

        let mut list = Vec::new();
        let mut infos = Vec::new();
        for (file_path, data) in consumers {
            match ConsumerFile::from_yaml(&data) {
                Ok(file) => {
                    infos.push(ConsumerInfo {
                        file_path,
                        username: file.username.clone(),
                        tags: file.tags.clone(),
                        groups: file.groups.clone(),
                        errors: Vec::new(),
                    });
                    list.push(Consumer::from(file));
                }
                Err(e) => {
                    warn!(file = %file_path, error = %e, "skipping invalid consumer file");
                    infos.push(ConsumerInfo {
                        file_path,
                        username: String::new(),
                        tags: Vec::new(),
                        groups: Vec::new(),
                        errors: vec![e.to_string()],
                    });
                }
            }
        }
        infos.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        Self {
            endpoints: endpoints.into_iter().map(Arc::new).collect(),
            consumers: Arc::new(list),
            consumer_files: infos,
        }
    }

    /// Endpoint for a request path; the one with most literal segments wins
    pub fn find(&self, path: &str) -> Option<(Arc<Endpoint>, BTreeMap<String, String>)> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        self.endpoints
            .iter()
            .filter_map(|ep| ep.matches(&segments).map(|params| (ep, params)))
            .max_by(|(a, _), (b, _)| {
                a.literal_count()
                    .cmp(&b.literal_count())
                    .then_with(|| b.file_path.cmp(&a.file_path))
            })
            .map(|(ep, params)| (ep.clone(), params))
    }
}

/// Every namespace's routes
#[derive(Default, Clone)]
pub struct RouteTable {
    pub namespaces: HashMap<String, Arc<NamespaceRoutes>>,
}

/// Introspection view of a compiled endpoint
#[derive(Debug, Clone, Serialize)]
pub struct RouteInfo {
    pub file_path: String,
    pub path: Option<String>,
    pub server_path: Option<String>,
    pub methods: Vec<String>,
    pub allow_anonymous: bool,
    pub timeout: u64,
    pub plugins: PluginsConfig,
    pub errors: Vec<String>,
}

/// Introspection view of a consumer; credentials are never shown
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerInfo {
    pub file_path: String,
    pub username: String,
    pub tags: Vec<String>,
    pub groups: Vec<String>,
    pub errors: Vec<String>,
}
