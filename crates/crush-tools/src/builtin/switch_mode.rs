// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use crush_config::AgentMode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::events::ToolEvent;
use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Lets the agent switch its own operating mode mid-turn (e.g. `research` to
/// `agent` once enough context has been gathered).
///
/// Shares the `Arc<Mutex<AgentMode>>` with the coordinator, which reads it
/// at the top of the next turn to pick the system prompt variant.
pub struct SwitchModeTool {
    mode: Arc<Mutex<AgentMode>>,
    event_tx: mpsc::Sender<ToolEvent>,
}

impl SwitchModeTool {
    pub fn new(mode: Arc<Mutex<AgentMode>>, event_tx: mpsc::Sender<ToolEvent>) -> Self {
        Self { mode, event_tx }
    }
}

#[async_trait]
impl Tool for SwitchModeTool {
    fn name(&self) -> &str {
        "switch_mode"
    }

    fn description(&self) -> &str {
        "Switch the agent's operating mode for the rest of the session. Use 'research' for \
         read-only investigation, 'plan' to produce a plan before editing, or 'agent' for \
         full read/write/execute access."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["research", "plan", "agent"]
                }
            },
            "required": ["mode"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let mode_str = match call.args.get("mode").and_then(|v| v.as_str()) {
            Some(s) => s,
            None => return ToolOutput::err(&call.id, "missing 'mode'"),
        };
        let mode = match AgentMode::from_str(mode_str) {
            Ok(m) => m,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        *self.mode.lock().await = mode;
        let _ = self.event_tx.send(ToolEvent::ModeChanged(mode)).await;

        ToolOutput::ok(&call.id, format!("switched to {mode} mode"))
    }
}
