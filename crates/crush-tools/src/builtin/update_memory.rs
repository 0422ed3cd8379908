// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolKind, ToolOutput};

/// Lets the agent append a durable note to a project-memory file
/// (`CRUSH.md` by default) so future sessions inherit it.
pub struct UpdateMemoryTool {
    pub memory_file: String,
}

#[async_trait]
impl Tool for UpdateMemoryTool {
    fn name(&self) -> &str {
        "update_memory"
    }

    fn description(&self) -> &str {
        "Append a short, durable note to the project's memory file so future sessions pick it \
         up automatically. Use for conventions, gotchas, or decisions worth remembering — not \
         for task-scoped notes that belong in todo_write."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "note": {
                    "type": "string",
                    "description": "The note to append, as a short markdown bullet or section"
                }
            },
            "required": ["note"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Edit
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let note = match call.args.get("note").and_then(|v| v.as_str()) {
            Some(n) => n.trim().to_string(),
            None => return ToolOutput::err(&call.id, "missing 'note'"),
        };
        if note.is_empty() {
            return ToolOutput::err(&call.id, "'note' must not be empty");
        }

        debug!(file = %self.memory_file, "update_memory tool");

        if let Some(parent) = std::path::Path::new(&self.memory_file).parent() {
            if !parent.as_os_str().is_empty() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
        }

        let entry = if note.starts_with('-') || note.starts_with('#') {
            format!("{note}\n")
        } else {
            format!("- {note}\n")
        };

        use tokio::io::AsyncWriteExt;
        match tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.memory_file)
            .await
        {
            Ok(mut f) => match f.write_all(entry.as_bytes()).await {
                Ok(_) => {
                    let _ = f.flush().await;
                    ToolOutput::ok(&call.id, format!("appended note to {}", self.memory_file))
                }
                Err(e) => ToolOutput::err(&call.id, format!("write error: {e}")),
            },
            Err(e) => ToolOutput::err(&call.id, format!("open error: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn appends_note_as_bullet() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static CTR: AtomicU32 = AtomicU32::new(0);
        let n = CTR.fetch_add(1, Ordering::Relaxed);
        let path = format!("/tmp/crush_memory_test_{}_{n}.md", std::process::id());

        let tool = UpdateMemoryTool {
            memory_file: path.clone(),
        };
        let out = tool
            .execute(&ToolCall {
                id: "m1".into(),
                name: "update_memory".into(),
                args: json!({"note": "prefer async fs ops here"}),
            })
            .await;
        assert!(!out.is_error, "{}", out.content);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("- prefer async fs ops here"));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn missing_note_is_error() {
        let tool = UpdateMemoryTool {
            memory_file: "/tmp/unused.md".into(),
        };
        let out = tool
            .execute(&ToolCall {
                id: "m2".into(),
                name: "update_memory".into(),
                args: json!({}),
            })
            .await;
        assert!(out.is_error);
    }
}
