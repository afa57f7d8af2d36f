// Script runtime behind js-inbound and js-outbound
//
// Scripts see one `input` map and either modify it in place or return a
// replacement. Besides the standard rhai library they get `log(v)`,
// `sleep(seconds)`, `from_json(s)` and `to_json(v)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rhai::{Dynamic, Engine, ImmutableString, Scope, AST};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::PluginError;

const MAX_OPERATIONS: u64 = 5_000_000;
const MAX_CALL_LEVELS: usize = 64;
const MAX_STRING_SIZE: usize = 32 * 1024 * 1024;
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// The `input` value a script works on
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ScriptInput {
    #[serde(rename = "Headers", default)]
    pub headers: BTreeMap<String, String>,
    #[serde(rename = "Queries", default)]
    pub queries: BTreeMap<String, String>,
    #[serde(rename = "Body", default)]
    pub body: String,
    #[serde(rename = "Consumer", default)]
    pub consumer: Value,
    #[serde(rename = "URLParams", default)]
    pub url_params: BTreeMap<String, String>,
    /// Response status; outbound scripts only
    #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// A compiled script with its sandboxed engine
#[derive(Clone)]
pub(crate) struct Script {
    engine: Arc<Engine>,
    ast: Arc<AST>,
}

impl Script {
    /// Compile `source`; `label` tags the script's log lines
    pub fn compile(typ: &str, source: &str, label: &str) -> Result<Self, PluginError> {
        if source.trim().is_empty() {
            return Err(PluginError::config(typ, "script cannot be empty"));
        }
        let engine = sandbox(label);
        let ast = engine
            .compile(source)
            .map_err(|e| PluginError::config(typ, format!("script does not compile: {e}")))?;
        Ok(Self {
            engine: Arc::new(engine),
            ast: Arc::new(ast),
        })
    }

    /// Run on the blocking pool; scripts may sleep
    pub async fn run(&self, input: ScriptInput) -> Result<ScriptInput, PluginError> {
        let engine = self.engine.clone();
        let ast = self.ast.clone();
        tokio::task::spawn_blocking(move || evaluate(&engine, &ast, input))
            .await
            .map_err(|e| PluginError::Script(format!("script aborted: {e}")))?
    }
}

fn sandbox(label: &str) -> Engine {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_call_levels(MAX_CALL_LEVELS);
    engine.set_max_string_size(MAX_STRING_SIZE);

    let endpoint = label.to_string();
    engine.register_fn("log", move |value: Dynamic| {
        info!(endpoint = %endpoint, "script: {value}");
    });
    engine.register_fn("sleep", |seconds: i64| sleep_for(seconds as f64));
    engine.register_fn("sleep", |seconds: rhai::FLOAT| sleep_for(seconds));
    engine.register_fn("from_json", |text: ImmutableString| -> Result<Dynamic, Box<rhai::EvalAltResult>> {
        let value: Value = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        rhai::serde::to_dynamic(value)
    });
    engine.register_fn("to_json", |value: Dynamic| -> Result<String, Box<rhai::EvalAltResult>> {
        let value: Value = rhai::serde::from_dynamic(&value)?;
        serde_json::to_string(&value).map_err(|e| e.to_string().into())
    });
    engine
}

fn sleep_for(seconds: f64) {
    if !seconds.is_finite() || seconds <= 0.0 {
        return;
    }
    let wanted = Duration::try_from_secs_f64(seconds).unwrap_or(MAX_SLEEP);
    std::thread::sleep(wanted.min(MAX_SLEEP));
}

fn evaluate(engine: &Engine, ast: &AST, input: ScriptInput) -> Result<ScriptInput, PluginError> {
    let input = rhai::serde::to_dynamic(&input).map_err(|e| PluginError::Script(e.to_string()))?;
    let mut scope = Scope::new();
    scope.push("input", input);

    let returned = engine
        .eval_ast_with_scope::<Dynamic>(&mut scope, ast)
        .map_err(|e| PluginError::Script(e.to_string()))?;
    let result = if returned.is_map() {
        returned
    } else {
        scope
            .get_value::<Dynamic>("input")
            .ok_or_else(|| PluginError::Script("script removed `input`".to_string()))?
    };
    rhai::serde::from_dynamic(&result)
        .map_err(|e| PluginError::Script(format!("script produced an invalid input: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input() -> ScriptInput {
        ScriptInput {
            headers: BTreeMap::from([("X-A".to_string(), "1".to_string())]),
            body: r#"{"n":2}"#.to_string(),
            consumer: json!({"Username": "alice"}),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_modify_in_place() {
        let script = Script::compile(
            "js-inbound",
            r#"
            input.Headers["X-B"] = input.Consumer.Username;
            let body = from_json(input.Body);
            body.n = body.n * 10;
            input.Body = to_json(body);
            log(input.Body);
            "#,
            "/ep",
        )
        .unwrap();
        let out = script.run(input()).await.unwrap();
        assert_eq!(out.headers["X-B"], "alice");
        assert_eq!(out.headers["X-A"], "1");
        assert_eq!(serde_json::from_str::<Value>(&out.body).unwrap(), json!({"n": 20}));
    }

    #[tokio::test]
    async fn test_returned_map_replaces_input() {
        let script = Script::compile("js-outbound", r#"#{ Body: "new", Code: 201 }"#, "/ep").unwrap();
        let out = script.run(input()).await.unwrap();
        assert_eq!(out.body, "new");
        assert_eq!(out.code, Some(201));
        assert!(out.headers.is_empty());
    }

    #[tokio::test]
    async fn test_runtime_error() {
        let script = Script::compile("js-inbound", r#"throw "denied";"#, "/ep").unwrap();
        let err = script.run(input()).await.unwrap_err();
        assert!(matches!(err, PluginError::Script(m) if m.contains("denied")));
    }

    #[tokio::test]
    async fn test_runaway_script_stopped() {
        let script = Script::compile("js-inbound", "loop { }", "/ep").unwrap();
        assert!(script.run(input()).await.is_err());
    }

    #[test]
    fn test_compile_error_is_config_error() {
        let err = Script::compile("js-inbound", "let = ;", "/ep").err().unwrap();
        assert!(matches!(err, PluginError::Config { .. }));
        assert!(Script::compile("js-inbound", "  ", "/ep").is_err());
    }
}
