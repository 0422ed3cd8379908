// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolKind, ToolOutput};

/// Surfaces compiler/linter diagnostics for a path without editing anything.
///
/// Autodetects a project linter (`cargo clippy`, falling back to `cargo
/// check`) when `command` isn't given. Read-only — never applies fixes.
pub struct ReadLintsTool;

#[async_trait]
impl Tool for ReadLintsTool {
    fn name(&self) -> &str {
        "read_lints"
    }

    fn description(&self) -> &str {
        "Run the project's linter/compiler and return diagnostics for a path, without making \
         any changes. Defaults to `cargo clippy` (falling back to `cargo check`) for Rust \
         projects; pass `command` to run something else."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to lint (default: current directory)"
                },
                "command": {
                    "type": "string",
                    "description": "Override the linter command (run via a shell, cwd = path)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of diagnostic lines to return (default 200)"
                }
            },
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Search
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::MatchList
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = call
            .args
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(".")
            .to_string();
        let limit = call.args.get("limit").and_then(|v| v.as_u64()).unwrap_or(200) as usize;
        let command = call
            .args
            .get("command")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        debug!(path = %path, command = ?command, "read_lints tool");

        let result = run_lint(&path, command.as_deref()).await;
        match result {
            Ok(output) if output.trim().is_empty() => ToolOutput::ok(&call.id, "(no diagnostics)"),
            Ok(output) => {
                let lines: Vec<&str> = output.lines().take(limit).collect();
                let total = output.lines().count();
                let mut text = lines.join("\n");
                if total > limit {
                    text.push_str(&format!(
                        "\n...[{} more lines not shown — narrow with path= to see all]",
                        total - limit
                    ));
                }
                ToolOutput::ok(&call.id, text)
            }
            Err(e) => ToolOutput::err(&call.id, format!("read_lints error: {e}")),
        }
    }
}

async fn run_lint(path: &str, command: Option<&str>) -> anyhow::Result<String> {
    let shell_cmd = match command {
        Some(c) => c.to_string(),
        None => {
            let has_clippy = tokio::process::Command::new("cargo")
                .args(["clippy", "--version"])
                .stdin(std::process::Stdio::null())
                .output()
                .await
                .map(|o| o.status.success())
                .unwrap_or(false);
            if has_clippy {
                "cargo clippy --message-format=short --all-targets 2>&1".to_string()
            } else {
                "cargo check --message-format=short --all-targets 2>&1".to_string()
            }
        }
    };

    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(&shell_cmd)
        .current_dir(path)
        .stdin(std::process::Stdio::null())
        .output()
        .await?;

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
