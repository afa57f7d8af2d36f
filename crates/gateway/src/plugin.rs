// Plugin traits and the registry that builds them from endpoint files
// Decision: One trait per phase; a type name belongs to exactly one phase
// Decision: Configuration maps are deserialized into typed structs that reject unknown fields

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use direktiv_core::manifest::PluginConfig;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::backend::GatewayBackend;
use crate::context::{GatewayRequest, GatewayResponse};
use crate::error::PluginError;
use crate::plugins::{auth, inbound, outbound, target};

/// Identifies the caller; may attach a consumer to the request
#[async_trait]
pub trait AuthPlugin: Send + Sync {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError>;
}

/// Rewrites the request, or answers it early by returning a response
#[async_trait]
pub trait InboundPlugin: Send + Sync {
    async fn handle(&self, req: &mut GatewayRequest)
        -> Result<Option<GatewayResponse>, PluginError>;
}

/// Produces the response
#[async_trait]
pub trait TargetPlugin: Send + Sync {
    async fn serve(&self, req: &GatewayRequest) -> Result<GatewayResponse, PluginError>;
}

/// Post-processes the target's response
#[async_trait]
pub trait OutboundPlugin: Send + Sync {
    async fn handle(
        &self,
        req: &GatewayRequest,
        resp: GatewayResponse,
    ) -> Result<GatewayResponse, PluginError>;
}

/// What a plugin may use while it is built
#[derive(Clone)]
pub struct PluginEnv {
    pub namespace: String,
    /// Namespace whose endpoints may reach into other namespaces
    pub system_namespace: String,
    /// Endpoint file the plugin belongs to
    pub endpoint: String,
    pub backend: Arc<dyn GatewayBackend>,
}

impl PluginEnv {
    /// Namespace a target reads from: its own unless configured otherwise,
    /// and only the system namespace may configure another one
    pub fn target_namespace(&self, typ: &str, configured: Option<&str>) -> Result<String, PluginError> {
        match configured.filter(|ns| !ns.is_empty()) {
            None => Ok(self.namespace.clone()),
            Some(ns) if ns == self.namespace => Ok(ns.to_string()),
            Some(ns) if self.namespace == self.system_namespace => Ok(ns.to_string()),
            Some(ns) => Err(PluginError::config(
                typ,
                format!("namespace '{ns}' is not reachable from '{}'", self.namespace),
            )),
        }
    }
}

pub type AuthBuild = fn(&Value, &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError>;
pub type InboundBuild = fn(&Value, &PluginEnv) -> Result<Arc<dyn InboundPlugin>, PluginError>;
pub type TargetBuild = fn(&Value, &PluginEnv) -> Result<Arc<dyn TargetPlugin>, PluginError>;
pub type OutboundBuild = fn(&Value, &PluginEnv) -> Result<Arc<dyn OutboundPlugin>, PluginError>;

#[derive(Clone, Copy)]
enum Factory {
    Auth(AuthBuild),
    Inbound(InboundBuild),
    Target(TargetBuild),
    Outbound(OutboundBuild),
}

impl Factory {
    fn phase(&self) -> &'static str {
        match self {
            Factory::Auth(_) => "auth",
            Factory::Inbound(_) => "inbound",
            Factory::Target(_) => "target",
            Factory::Outbound(_) => "outbound",
        }
    }
}

/// Plugin constructors keyed by `type`
#[derive(Clone)]
pub struct PluginRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Every plugin shipped with the gateway
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.auth("basic-auth", auth::basic_auth);
        registry.auth("key-auth", auth::key_auth);
        registry.auth("github-webhook-auth", auth::github_webhook);
        registry.auth("gitlab-webhook-auth", auth::gitlab_webhook);
        registry.auth("slack-webhook-auth", auth::slack_webhook);

        registry.inbound("js-inbound", inbound::js_inbound);
        registry.inbound("acl", inbound::acl);
        registry.inbound("request-convert", inbound::request_convert);
        registry.inbound("header-manipulation", inbound::header_manipulation);

        registry.target("instant-response", target::instant_response);
        registry.target("target-flow", target::target_flow);
        registry.target("target-namespace-file", target::namespace_file);
        registry.target("target-namespace-var", target::namespace_var);
        registry.target("target-flow-var", target::flow_var);
        registry.target("target-debug", target::debug_target);

        registry.outbound("js-outbound", outbound::js_outbound);
        registry
    }

    pub fn auth(&mut self, typ: &'static str, build: AuthBuild) {
        self.factories.insert(typ, Factory::Auth(build));
    }

    pub fn inbound(&mut self, typ: &'static str, build: InboundBuild) {
        self.factories.insert(typ, Factory::Inbound(build));
    }

    pub fn target(&mut self, typ: &'static str, build: TargetBuild) {
        self.factories.insert(typ, Factory::Target(build));
    }

    pub fn outbound(&mut self, typ: &'static str, build: OutboundBuild) {
        self.factories.insert(typ, Factory::Outbound(build));
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.factories.keys().copied().collect();
        types.sort_unstable();
        types
    }

    fn factory(&self, config: &PluginConfig) -> Result<Factory, PluginError> {
        self.factories
            .get(config.typ.as_str())
            .copied()
            .ok_or_else(|| PluginError::UnknownType(config.typ.clone()))
    }

    pub fn build_auth(
        &self,
        config: &PluginConfig,
        env: &PluginEnv,
    ) -> Result<Arc<dyn AuthPlugin>, PluginError> {
        match self.factory(config)? {
            Factory::Auth(build) => build(&config.configuration, env),
            other => Err(wrong_phase(config, other, "auth")),
        }
    }

    pub fn build_inbound(
        &self,
        config: &PluginConfig,
        env: &PluginEnv,
    ) -> Result<Arc<dyn InboundPlugin>, PluginError> {
        match self.factory(config)? {
            Factory::Inbound(build) => build(&config.configuration, env),
            other => Err(wrong_phase(config, other, "inbound")),
        }
    }

    pub fn build_target(
        &self,
        config: &PluginConfig,
        env: &PluginEnv,
    ) -> Result<Arc<dyn TargetPlugin>, PluginError> {
        match self.factory(config)? {
            Factory::Target(build) => build(&config.configuration, env),
            other => Err(wrong_phase(config, other, "target")),
        }
    }

    pub fn build_outbound(
        &self,
        config: &PluginConfig,
        env: &PluginEnv,
    ) -> Result<Arc<dyn OutboundPlugin>, PluginError> {
        match self.factory(config)? {
            Factory::Outbound(build) => build(&config.configuration, env),
            other => Err(wrong_phase(config, other, "outbound")),
        }
    }
}

fn wrong_phase(config: &PluginConfig, found: Factory, phase: &'static str) -> PluginError {
    tracing::debug!(typ = %config.typ, found = found.phase(), phase, "plugin used in the wrong phase");
    PluginError::WrongPhase {
        typ: config.typ.clone(),
        phase,
    }
}

/// Typed configuration of a plugin; a missing map means all defaults
pub(crate) fn parse_config<T>(typ: &str, config: &Value) -> Result<T, PluginError>
where
    T: DeserializeOwned,
{
    let config = match config {
        Value::Null => Value::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| PluginError::config(typ, e))
}
