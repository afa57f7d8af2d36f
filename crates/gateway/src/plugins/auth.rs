// Auth plugins
//
// An auth plugin that does not recognize the caller leaves the request alone;
// the pipeline decides afterwards whether an anonymous request may continue.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::{
    Consumer, GatewayRequest, CONSUMER_GROUPS_HEADER, CONSUMER_TAGS_HEADER, CONSUMER_USER_HEADER,
};
use crate::error::PluginError;
use crate::plugin::{parse_config, AuthPlugin, PluginEnv};

type HmacSha256 = Hmac<Sha256>;

pub const GITHUB_SIGNATURE_HEADER: &str = "x-hub-signature-256";
pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";
pub const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
pub const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";

/// Slack requests older than this are replays
const SLACK_MAX_AGE_SECS: i64 = 300;

/// Compare two secrets in time independent of where they differ
///
/// Both sides are hashed first so the comparison also hides their lengths.
pub(crate) fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn attach(req: &mut GatewayRequest, consumer: Consumer, identity: &IdentityHeaders) {
    if identity.add_username_header {
        set_header(req, CONSUMER_USER_HEADER, &consumer.username);
    }
    if identity.add_tags_header {
        set_header(req, CONSUMER_TAGS_HEADER, &consumer.tags.join(","));
    }
    if identity.add_groups_header {
        set_header(req, CONSUMER_GROUPS_HEADER, &consumer.groups.join(","));
    }
    req.consumer = Some(consumer);
}

fn set_header(req: &mut GatewayRequest, name: &'static str, value: &str) {
    if let Ok(value) = value.parse() {
        req.headers.insert(name, value);
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct IdentityHeaders {
    add_username_header: bool,
    add_tags_header: bool,
    add_groups_header: bool,
}

// ============================================================================
// basic-auth
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct BasicAuthConfig {
    #[serde(default)]
    add_username_header: bool,
    #[serde(default)]
    add_tags_header: bool,
    #[serde(default)]
    add_groups_header: bool,
}

struct BasicAuth {
    identity: IdentityHeaders,
}

pub fn basic_auth(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError> {
    let config: BasicAuthConfig = parse_config("basic-auth", config)?;
    Ok(Arc::new(BasicAuth {
        identity: IdentityHeaders {
            add_username_header: config.add_username_header,
            add_tags_header: config.add_tags_header,
            add_groups_header: config.add_groups_header,
        },
    }))
}

/// `Authorization: Basic base64(user:password)`
fn basic_credentials(req: &GatewayRequest) -> Option<(String, String)> {
    let header = req.header("authorization")?;
    let encoded = header.strip_prefix("Basic ").or_else(|| header.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[async_trait]
impl AuthPlugin for BasicAuth {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError> {
        if req.consumer.is_some() {
            return Ok(());
        }
        let Some((user, password)) = basic_credentials(req) else {
            return Ok(());
        };
        let matched = req.consumers.iter().find(|c| {
            let user_ok = secure_eq(c.username.as_bytes(), user.as_bytes());
            let password_ok = c
                .password
                .as_deref()
                .is_some_and(|p| secure_eq(p.as_bytes(), password.as_bytes()));
            user_ok && password_ok
        });
        match matched.cloned() {
            Some(consumer) => attach(req, consumer, &self.identity),
            None => debug!(namespace = %req.namespace, "basic auth rejected"),
        }
        Ok(())
    }
}

// ============================================================================
// key-auth
// ============================================================================

fn default_key_name() -> String {
    "API-Token".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyAuthConfig {
    #[serde(default = "default_key_name")]
    key_name: String,
    #[serde(default)]
    add_username_header: bool,
    #[serde(default)]
    add_tags_header: bool,
    #[serde(default)]
    add_groups_header: bool,
}

struct KeyAuth {
    key_name: String,
    identity: IdentityHeaders,
}

pub fn key_auth(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError> {
    let config: KeyAuthConfig = parse_config("key-auth", config)?;
    if config.key_name.trim().is_empty() {
        return Err(PluginError::config("key-auth", "key_name cannot be empty"));
    }
    Ok(Arc::new(KeyAuth {
        key_name: config.key_name,
        identity: IdentityHeaders {
            add_username_header: config.add_username_header,
            add_tags_header: config.add_tags_header,
            add_groups_header: config.add_groups_header,
        },
    }))
}

#[async_trait]
impl AuthPlugin for KeyAuth {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError> {
        if req.consumer.is_some() {
            return Ok(());
        }
        let Some(key) = req.header(&self.key_name).map(str::to_string) else {
            return Ok(());
        };
        let matched = req.consumers.iter().find(|c| {
            c.api_key
                .as_deref()
                .is_some_and(|k| secure_eq(k.as_bytes(), key.as_bytes()))
        });
        match matched.cloned() {
            Some(consumer) => attach(req, consumer, &self.identity),
            None => debug!(namespace = %req.namespace, header = %self.key_name, "api key rejected"),
        }
        Ok(())
    }
}

// ============================================================================
// Webhooks
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WebhookConfig {
    secret: String,
}

fn webhook_secret(typ: &str, config: &Value) -> Result<String, PluginError> {
    let config: WebhookConfig = parse_config(typ, config)?;
    if config.secret.is_empty() {
        return Err(PluginError::config(typ, "secret cannot be empty"));
    }
    Ok(config.secret)
}

fn verify_hmac(secret: &[u8], message: &[&[u8]], signature_hex: &str) -> bool {
    let Ok(expected) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    for part in message {
        mac.update(part);
    }
    mac.verify_slice(&expected).is_ok()
}

/// `X-Hub-Signature-256: sha256=<hmac of body>`
struct GithubWebhook {
    secret: String,
}

pub fn github_webhook(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError> {
    Ok(Arc::new(GithubWebhook {
        secret: webhook_secret("github-webhook-auth", config)?,
    }))
}

#[async_trait]
impl AuthPlugin for GithubWebhook {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError> {
        let Some(signature) = req.header(GITHUB_SIGNATURE_HEADER) else {
            return Ok(());
        };
        let signature = signature.strip_prefix("sha256=").unwrap_or(signature);
        if verify_hmac(self.secret.as_bytes(), &[&req.body[..]], signature) {
            req.consumer = Some(Consumer::synthetic("github"));
        } else {
            debug!(namespace = %req.namespace, "github signature mismatch");
        }
        Ok(())
    }
}

/// `X-Gitlab-Token` carries the shared secret itself
struct GitlabWebhook {
    secret: String,
}

pub fn gitlab_webhook(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError> {
    Ok(Arc::new(GitlabWebhook {
        secret: webhook_secret("gitlab-webhook-auth", config)?,
    }))
}

#[async_trait]
impl AuthPlugin for GitlabWebhook {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError> {
        let Some(token) = req.header(GITLAB_TOKEN_HEADER) else {
            return Ok(());
        };
        if secure_eq(token.as_bytes(), self.secret.as_bytes()) {
            req.consumer = Some(Consumer::synthetic("gitlab"));
        } else {
            debug!(namespace = %req.namespace, "gitlab token mismatch");
        }
        Ok(())
    }
}

/// `X-Slack-Signature: v0=<hmac of "v0:{timestamp}:{body}">`
struct SlackWebhook {
    secret: String,
}

pub fn slack_webhook(config: &Value, _env: &PluginEnv) -> Result<Arc<dyn AuthPlugin>, PluginError> {
    Ok(Arc::new(SlackWebhook {
        secret: webhook_secret("slack-webhook-auth", config)?,
    }))
}

#[async_trait]
impl AuthPlugin for SlackWebhook {
    async fn authenticate(&self, req: &mut GatewayRequest) -> Result<(), PluginError> {
        let (Some(timestamp), Some(signature)) = (
            req.header(SLACK_TIMESTAMP_HEADER),
            req.header(SLACK_SIGNATURE_HEADER),
        ) else {
            return Ok(());
        };
        let Ok(sent) = timestamp.trim().parse::<i64>() else {
            return Ok(());
        };
        if (Utc::now().timestamp() - sent).abs() > SLACK_MAX_AGE_SECS {
            debug!(namespace = %req.namespace, "stale slack request");
            return Ok(());
        }
        let signature = signature.strip_prefix("v0=").unwrap_or(signature);
        let prefix = format!("v0:{}:", timestamp.trim());
        if verify_hmac(self.secret.as_bytes(), &[prefix.as_bytes(), &req.body[..]], signature) {
            req.consumer = Some(Consumer::synthetic("slack"));
        } else {
            debug!(namespace = %req.namespace, "slack signature mismatch");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::env;
    use axum::http::Method;
    use bytes::Bytes;
    use serde_json::json;

    fn consumers() -> Arc<Vec<Consumer>> {
        Arc::new(vec![Consumer {
            username: "alice".to_string(),
            password: Some("secret".to_string()),
            api_key: Some("key-1".to_string()),
            tags: vec!["t1".to_string()],
            groups: vec!["admins".to_string(), "ops".to_string()],
        }])
    }

    fn request() -> GatewayRequest {
        let mut req = GatewayRequest::new("ns", Method::POST, "/hook");
        req.consumers = consumers();
        req
    }

    fn sign(secret: &str, parts: &[&[u8]]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        for part in parts {
            mac.update(part);
        }
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_secure_eq() {
        assert!(secure_eq(b"abc", b"abc"));
        assert!(!secure_eq(b"abc", b"abd"));
        assert!(!secure_eq(b"abc", b"abcd"));
    }

    #[tokio::test]
    async fn test_basic_auth_attaches_consumer_and_headers() {
        let plugin = basic_auth(
            &json!({"add_username_header": true, "add_groups_header": true}),
            &env(),
        )
        .unwrap();
        let mut req = request();
        req.headers.insert(
            "authorization",
            format!("Basic {}", STANDARD.encode("alice:secret")).parse().unwrap(),
        );
        plugin.authenticate(&mut req).await.unwrap();
        assert_eq!(req.consumer.as_ref().unwrap().username, "alice");
        assert_eq!(req.header(CONSUMER_USER_HEADER), Some("alice"));
        assert_eq!(req.header(CONSUMER_GROUPS_HEADER), Some("admins,ops"));
        assert_eq!(req.header(CONSUMER_TAGS_HEADER), None);
    }

    #[tokio::test]
    async fn test_basic_auth_wrong_password() {
        let plugin = basic_auth(&Value::Null, &env()).unwrap();
        let mut req = request();
        req.headers.insert(
            "authorization",
            format!("Basic {}", STANDARD.encode("alice:nope")).parse().unwrap(),
        );
        plugin.authenticate(&mut req).await.unwrap();
        assert!(req.consumer.is_none());
    }

    #[tokio::test]
    async fn test_key_auth_default_and_custom_header() {
        let plugin = key_auth(&Value::Null, &env()).unwrap();
        let mut req = request();
        req.headers.insert("api-token", "key-1".parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert_eq!(req.consumer.unwrap().username, "alice");

        let plugin = key_auth(&json!({"key_name": "X-Key"}), &env()).unwrap();
        let mut req = request();
        req.headers.insert("api-token", "key-1".parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert!(req.consumer.is_none());
    }

    #[test]
    fn test_unknown_config_field_rejected() {
        let err = key_auth(&json!({"keyname": "X"}), &env()).err().unwrap();
        assert!(matches!(err, PluginError::Config { .. }));
        assert!(github_webhook(&json!({}), &env()).is_err());
    }

    #[tokio::test]
    async fn test_github_signature() {
        let plugin = github_webhook(&json!({"secret": "s3"}), &env()).unwrap();
        let body = br#"{"action":"opened"}"#;

        let mut req = request();
        req.body = Bytes::from_static(body);
        let signature = format!("sha256={}", sign("s3", &[body]));
        req.headers.insert(GITHUB_SIGNATURE_HEADER, signature.parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert_eq!(req.consumer.as_ref().unwrap().username, "github");
        assert_eq!(&req.body[..], body);

        let mut req = request();
        req.body = Bytes::from_static(b"tampered");
        req.headers.insert(GITHUB_SIGNATURE_HEADER, signature.parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert!(req.consumer.is_none());
    }

    #[tokio::test]
    async fn test_gitlab_token() {
        let plugin = gitlab_webhook(&json!({"secret": "tok"}), &env()).unwrap();
        let mut req = request();
        req.headers.insert(GITLAB_TOKEN_HEADER, "tok".parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert_eq!(req.consumer.unwrap().username, "gitlab");
    }

    #[tokio::test]
    async fn test_slack_signature_and_staleness() {
        let plugin = slack_webhook(&json!({"secret": "sl"}), &env()).unwrap();
        let body = b"token=x&team_id=T1";

        let now = Utc::now().timestamp().to_string();
        let mut req = request();
        req.body = Bytes::from_static(body);
        let prefix = format!("v0:{now}:");
        let signature = format!("v0={}", sign("sl", &[prefix.as_bytes(), body]));
        req.headers.insert(SLACK_TIMESTAMP_HEADER, now.parse().unwrap());
        req.headers.insert(SLACK_SIGNATURE_HEADER, signature.parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert_eq!(req.consumer.unwrap().username, "slack");

        let old = (Utc::now().timestamp() - 3600).to_string();
        let prefix = format!("v0:{old}:");
        let signature = format!("v0={}", sign("sl", &[prefix.as_bytes(), body]));
        let mut req = request();
        req.body = Bytes::from_static(body);
        req.headers.insert(SLACK_TIMESTAMP_HEADER, old.parse().unwrap());
        req.headers.insert(SLACK_SIGNATURE_HEADER, signature.parse().unwrap());
        plugin.authenticate(&mut req).await.unwrap();
        assert!(req.consumer.is_none());
    }
}
