// Command line parsing
//
// Backticks are evaluated first with `sh -c`, then `$VAR` / `${VAR}` are
// expanded against the command's envs and the process environment outside
// single quotes, then the line is split into words with POSIX quoting rules.

use std::convert::Infallible;
use std::path::Path;

use direktiv_core::workflow::EnvVar;
use tokio::process::Command;

use crate::error::ExecError;

/// Split a command line into binary and arguments
pub async fn parse_command(
    line: &str,
    envs: &[EnvVar],
    dir: &Path,
) -> Result<Vec<String>, ExecError> {
    let line = eval_backticks(line, envs, dir).await?;
    let expanded = expand_env(&line, envs, dir);
    shell_words::split(&expanded)
        .map_err(|e| ExecError::BadRequest(format!("cannot parse command '{line}': {e}")))
}

fn expand_env(line: &str, envs: &[EnvVar], dir: &Path) -> String {
    let lookup = |name: &str| -> Result<Option<String>, Infallible> {
        if name == "HOME" {
            return Ok(Some(dir.to_string_lossy().into_owned()));
        }
        if let Some(var) = envs.iter().rev().find(|e| e.name == name) {
            return Ok(Some(var.value.clone()));
        }
        // Unset variables expand to nothing, as in a shell
        Ok(Some(std::env::var(name).unwrap_or_default()))
    };
    let mut out = String::with_capacity(line.len());
    for (literal, span) in quoted_spans(line) {
        if literal {
            out.push_str(span);
            continue;
        }
        match shellexpand::env_with_context(span, &lookup) {
            Ok(expanded) => out.push_str(&expanded),
            Err(_) => out.push_str(span),
        }
    }
    out
}

/// Split `line` into spans, flagging single-quoted ones (quotes included)
fn quoted_spans(line: &str) -> Vec<(bool, &str)> {
    let mut spans = Vec::new();
    let mut start = 0;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if in_single {
            if c == '\'' {
                spans.push((true, &line[start..=i]));
                start = i + 1;
                in_single = false;
            }
            continue;
        }
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' => in_double = !in_double,
            '\'' if !in_double => {
                if start < i {
                    spans.push((false, &line[start..i]));
                }
                start = i;
                in_single = true;
            }
            _ => {}
        }
    }
    if start < line.len() {
        spans.push((in_single, &line[start..]));
    }
    spans
}

async fn eval_backticks(line: &str, envs: &[EnvVar], dir: &Path) -> Result<String, ExecError> {
    if !line.contains('`') {
        return Ok(line.to_string());
    }
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    let mut in_single = false;
    let mut in_double = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                out.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                out.push(c);
            }
            '\\' if !in_single => {
                out.push(c);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            '`' if !in_single => {
                let mut inner = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '`' {
                        closed = true;
                        break;
                    }
                    inner.push(c);
                }
                if !closed {
                    return Err(ExecError::BadRequest(format!(
                        "unterminated backtick in '{line}'"
                    )));
                }
                out.push_str(&run_inline(&inner, envs, dir).await?);
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

async fn run_inline(script: &str, envs: &[EnvVar], dir: &Path) -> Result<String, ExecError> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .current_dir(dir)
        .env("HOME", dir)
        .envs(envs.iter().map(|e| (e.name.as_str(), e.value.as_str())))
        .output()
        .await?;
    if !output.status.success() {
        return Err(ExecError::BadRequest(format!(
            "backtick command '{script}' failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string())
}
