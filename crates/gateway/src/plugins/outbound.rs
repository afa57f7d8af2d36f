// Outbound plugins: post-process the target's response

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::Value;

use crate::context::{canonical_header, GatewayRequest, GatewayResponse};
use crate::error::PluginError;
use crate::plugin::{parse_config, OutboundPlugin, PluginEnv};
use crate::plugins::inbound::{rebuild_headers, script_input};
use crate::plugins::script::Script;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScriptConfig {
    script: String,
}

/// Script sees the response as `input.Headers`, `input.Body` and `input.Code`
struct JsOutbound {
    script: Script,
}

pub fn js_outbound(config: &Value, env: &PluginEnv) -> Result<Arc<dyn OutboundPlugin>, PluginError> {
    let config: ScriptConfig = parse_config("js-outbound", config)?;
    Ok(Arc::new(JsOutbound {
        script: Script::compile("js-outbound", &config.script, &env.endpoint)?,
    }))
}

#[async_trait]
impl OutboundPlugin for JsOutbound {
    async fn handle(
        &self,
        req: &GatewayRequest,
        resp: GatewayResponse,
    ) -> Result<GatewayResponse, PluginError> {
        let mut input = script_input(req);
        input.headers = resp
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    canonical_header(name.as_str()),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        input.body = String::from_utf8_lossy(&resp.body).into_owned();
        input.code = Some(i64::from(resp.status.as_u16()));

        let out = self.script.run(input).await?;
        let status = match out.code {
            Some(code) => u16::try_from(code)
                .ok()
                .and_then(|c| StatusCode::from_u16(c).ok())
                .ok_or_else(|| PluginError::Script(format!("invalid status code {code}")))?,
            None => resp.status,
        };
        Ok(GatewayResponse {
            status,
            headers: rebuild_headers(&out.headers),
            body: Bytes::from(out.body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::env;
    use axum::http::Method;
    use serde_json::json;

    #[tokio::test]
    async fn test_js_outbound_rewrites_response() {
        let plugin = js_outbound(
            &json!({"script": r#"
                if input.Code == 200 {
                    input.Code = 202;
                }
                input.Headers["X-Wrapped"] = "yes";
                input.Body = `{"wrapped":${input.Body}}`;
            "#}),
            &env(),
        )
        .unwrap();
        let req = GatewayRequest::new("ns", Method::GET, "/");
        let resp = GatewayResponse::new(StatusCode::OK, "application/json", r#"{"a":1}"#);
        let out = plugin.handle(&req, resp).await.unwrap();

        assert_eq!(out.status, StatusCode::ACCEPTED);
        assert_eq!(out.headers["x-wrapped"], "yes");
        assert_eq!(out.content_type(), Some("application/json"));
        let body: Value = serde_json::from_slice(&out.body).unwrap();
        assert_eq!(body, json!({"wrapped": {"a": 1}}));
    }

    #[tokio::test]
    async fn test_js_outbound_bad_code() {
        let plugin = js_outbound(&json!({"script": "input.Code = 5;"}), &env()).unwrap();
        let req = GatewayRequest::new("ns", Method::GET, "/");
        let resp = GatewayResponse::new(StatusCode::OK, "text/plain", "x");
        let err = plugin.handle(&req, resp).await.unwrap_err();
        assert!(matches!(err, PluginError::Script(_)));
    }
}
