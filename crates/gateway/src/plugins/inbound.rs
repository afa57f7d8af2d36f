// Inbound plugins: run after auth, before the target

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::context::{GatewayRequest, GatewayResponse};
use crate::error::PluginError;
use crate::plugin::{parse_config, InboundPlugin, PluginEnv};
use crate::plugins::script::{Script, ScriptInput};

// ============================================================================
// js-inbound
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptConfig {
    script: String,
}

struct JsInbound {
    script: Script,
}

pub fn js_inbound(config: &Value, env: &PluginEnv) -> Result<Arc<dyn InboundPlugin>, PluginError> {
    let config: ScriptConfig = parse_config("js-inbound", config)?;
    Ok(Arc::new(JsInbound {
        script: Script::compile("js-inbound", &config.script, &env.endpoint)?,
    }))
}

pub(crate) fn script_input(req: &GatewayRequest) -> ScriptInput {
    ScriptInput {
        headers: req.header_map(),
        queries: req.query_map(),
        body: String::from_utf8_lossy(&req.body).into_owned(),
        consumer: req.consumer.as_ref().map(|c| c.to_value()).unwrap_or(Value::Null),
        url_params: req.params.clone(),
        code: None,
    }
}

/// Header map from name/value pairs, dropping anything http cannot carry
pub(crate) fn rebuild_headers<'a>(pairs: impl IntoIterator<Item = (&'a String, &'a String)>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        match (HeaderName::try_from(name.as_str()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => debug!(header = %name, "script set an invalid header"),
        }
    }
    headers
}

#[async_trait]
impl InboundPlugin for JsInbound {
    async fn handle(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<Option<GatewayResponse>, PluginError> {
        let out = self.script.run(script_input(req)).await?;
        req.headers = rebuild_headers(&out.headers);
        req.query = out.queries.into_iter().collect();
        req.body = Bytes::from(out.body);
        Ok(None)
    }
}

// ============================================================================
// acl
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct AclConfig {
    #[serde(default)]
    allow_groups: Vec<String>,
    #[serde(default)]
    deny_groups: Vec<String>,
    #[serde(default)]
    allow_tags: Vec<String>,
    #[serde(default)]
    deny_tags: Vec<String>,
}

/// Deny lists win over allow lists; a consumer matching neither is denied
struct Acl {
    config: AclConfig,
}

pub fn acl(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn InboundPlugin>, PluginError> {
    Ok(Arc::new(Acl {
        config: parse_config("acl", config)?,
    }))
}

fn any_shared(a: &[String], b: &[String]) -> bool {
    a.iter().any(|x| b.contains(x))
}

#[async_trait]
impl InboundPlugin for Acl {
    async fn handle(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<Option<GatewayResponse>, PluginError> {
        let denied = |reason: &str| {
            Ok(Some(GatewayResponse::error(
                StatusCode::FORBIDDEN,
                "forbidden",
                format!("access denied: {reason}"),
            )))
        };
        let Some(consumer) = &req.consumer else {
            return denied("no consumer");
        };
        let c = &self.config;
        if any_shared(&consumer.groups, &c.deny_groups) || any_shared(&consumer.tags, &c.deny_tags) {
            return denied("consumer is on a deny list");
        }
        if any_shared(&consumer.groups, &c.allow_groups) || any_shared(&consumer.tags, &c.allow_tags) {
            return Ok(None);
        }
        denied("consumer is not on an allow list")
    }
}

// ============================================================================
// request-convert
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RequestConvertConfig {
    #[serde(default)]
    omit_headers: bool,
    #[serde(default)]
    omit_queries: bool,
    #[serde(default)]
    omit_body: bool,
    #[serde(default)]
    omit_consumer: bool,
}

/// Replace the body with a JSON document describing the whole request
struct RequestConvert {
    config: RequestConvertConfig,
}

pub fn request_convert(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn InboundPlugin>, PluginError> {
    Ok(Arc::new(RequestConvert {
        config: parse_config("request-convert", config)?,
    }))
}

#[async_trait]
impl InboundPlugin for RequestConvert {
    async fn handle(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<Option<GatewayResponse>, PluginError> {
        let mut doc = Map::new();
        doc.insert("url_params".to_string(), json!(req.params));
        if !self.config.omit_queries {
            doc.insert("query_params".to_string(), json!(req.query_map()));
        }
        if !self.config.omit_headers {
            doc.insert("headers".to_string(), json!(req.header_map()));
        }
        if !self.config.omit_consumer {
            let consumer = req.consumer.as_ref().map(|c| c.to_value()).unwrap_or(Value::Null);
            doc.insert("consumer".to_string(), consumer);
        }
        if !self.config.omit_body {
            doc.insert("body".to_string(), req.body_value());
        }
        req.body = Bytes::from(serde_json::to_vec(&Value::Object(doc)).unwrap_or_default());
        req.headers.insert(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        req.headers.remove(axum::http::header::CONTENT_LENGTH);
        Ok(None)
    }
}

// ============================================================================
// header-manipulation
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderEntry {
    name: String,
    #[serde(default)]
    value: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HeaderManipulationConfig {
    #[serde(default)]
    headers_to_add: Vec<HeaderEntry>,
    #[serde(default)]
    headers_to_modify: Vec<HeaderEntry>,
    #[serde(default)]
    headers_to_remove: Vec<HeaderEntry>,
}

struct HeaderManipulation {
    add: Vec<(HeaderName, HeaderValue)>,
    modify: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

fn header_pairs(entries: &[HeaderEntry]) -> Result<Vec<(HeaderName, HeaderValue)>, PluginError> {
    entries
        .iter()
        .map(|e| {
            let name = HeaderName::try_from(e.name.as_str())
                .map_err(|err| PluginError::config("header-manipulation", format!("{}: {err}", e.name)))?;
            let value = HeaderValue::from_str(&e.value)
                .map_err(|err| PluginError::config("header-manipulation", format!("{}: {err}", e.name)))?;
            Ok((name, value))
        })
        .collect()
}

pub fn header_manipulation(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn InboundPlugin>, PluginError> {
    let config: HeaderManipulationConfig = parse_config("header-manipulation", config)?;
    let remove = header_pairs(&config.headers_to_remove)?
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    Ok(Arc::new(HeaderManipulation {
        add: header_pairs(&config.headers_to_add)?,
        modify: header_pairs(&config.headers_to_modify)?,
        remove,
    }))
}

#[async_trait]
impl InboundPlugin for HeaderManipulation {
    async fn handle(
        &self,
        req: &mut GatewayRequest,
    ) -> Result<Option<GatewayResponse>, PluginError> {
        for (name, value) in &self.add {
            req.headers.append(name.clone(), value.clone());
        }
        // only headers the client sent are modified
        for (name, value) in &self.modify {
            if req.headers.contains_key(name) {
                req.headers.insert(name.clone(), value.clone());
            }
        }
        for name in &self.remove {
            req.headers.remove(name);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Consumer;
    use crate::testing::env;
    use axum::http::Method;

    fn with_consumer(groups: &[&str], tags: &[&str]) -> GatewayRequest {
        let mut req = GatewayRequest::new("ns", Method::GET, "/");
        req.consumer = Some(Consumer {
            username: "bob".to_string(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        });
        req
    }

    #[tokio::test]
    async fn test_acl() {
        let plugin = acl(
            &json!({"allow_groups": ["ops"], "deny_tags": ["blocked"]}),
            &env(),
        )
        .unwrap();

        let mut req = with_consumer(&["ops"], &[]);
        assert!(plugin.handle(&mut req).await.unwrap().is_none());

        let mut req = with_consumer(&["ops"], &["blocked"]);
        let resp = plugin.handle(&mut req).await.unwrap().unwrap();
        assert_eq!(resp.status, StatusCode::FORBIDDEN);

        let mut req = with_consumer(&["dev"], &[]);
        assert!(plugin.handle(&mut req).await.unwrap().is_some());

        let mut req = GatewayRequest::new("ns", Method::GET, "/");
        assert!(plugin.handle(&mut req).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_convert() {
        let plugin = request_convert(&json!({"omit_headers": true}), &env()).unwrap();
        let mut req = with_consumer(&["g"], &[]);
        req.params.insert("id".to_string(), "7".to_string());
        req.query.push(("q".to_string(), "x".to_string()));
        req.body = Bytes::from_static(br#"{"a":true}"#);
        plugin.handle(&mut req).await.unwrap();

        let doc: Value = serde_json::from_slice(&req.body).unwrap();
        assert_eq!(
            doc,
            json!({
                "url_params": {"id": "7"},
                "query_params": {"q": "x"},
                "consumer": {"Username": "bob", "Tags": [], "Groups": ["g"]},
                "body": {"a": true},
            })
        );
        assert_eq!(req.header("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_header_manipulation() {
        let plugin = header_manipulation(
            &json!({
                "headers_to_add": [{"name": "X-New", "value": "1"}],
                "headers_to_modify": [{"name": "X-Mod", "value": "changed"}, {"name": "X-Absent", "value": "v"}],
                "headers_to_remove": [{"name": "X-Gone"}],
            }),
            &env(),
        )
        .unwrap();
        let mut req = GatewayRequest::new("ns", Method::GET, "/");
        req.headers.insert("x-mod", HeaderValue::from_static("orig"));
        req.headers.insert("x-gone", HeaderValue::from_static("bye"));
        plugin.handle(&mut req).await.unwrap();

        assert_eq!(req.header("x-new"), Some("1"));
        assert_eq!(req.header("x-mod"), Some("changed"));
        assert_eq!(req.header("x-absent"), None);
        assert_eq!(req.header("x-gone"), None);
    }

    #[test]
    fn test_header_manipulation_rejects_bad_names() {
        let result = header_manipulation(
            &json!({"headers_to_add": [{"name": "bad header", "value": "1"}]}),
            &env(),
        );
        assert!(matches!(result.err(), Some(PluginError::Config { .. })));
    }

    #[tokio::test]
    async fn test_js_inbound_rewrites_request() {
        let plugin = js_inbound(
            &json!({"script": r#"
                input.Headers["X-Param"] = input.URLParams.id;
                input.Queries.extra = "1";
                input.Body = "rewritten";
            "#}),
            &env(),
        )
        .unwrap();
        let mut req = GatewayRequest::new("ns", Method::POST, "/items/9");
        req.params.insert("id".to_string(), "9".to_string());
        req.body = Bytes::from_static(b"original");
        plugin.handle(&mut req).await.unwrap();

        assert_eq!(req.header("x-param"), Some("9"));
        assert_eq!(req.query_value("extra"), Some("1"));
        assert_eq!(&req.body[..], b"rewritten");
    }
}
