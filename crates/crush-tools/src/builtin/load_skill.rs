// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use crush_runtime::SharedSkills;
use serde_json::{json, Value};

use crate::policy::ApprovalPolicy;
use crate::tool::{OutputCategory, Tool, ToolCall, ToolKind, ToolOutput};

/// Loads a discovered skill's full body into context on demand, keeping the
/// system prompt itself limited to name + description.
pub struct LoadSkillTool {
    skills: SharedSkills,
}

impl LoadSkillTool {
    pub fn new(skills: SharedSkills) -> Self {
        Self { skills }
    }
}

#[async_trait]
impl Tool for LoadSkillTool {
    fn name(&self) -> &str {
        "load_skill"
    }

    fn description(&self) -> &str {
        "Load the full instructions for a discovered skill by its command key (e.g. 'crush' or \
         'crush/plan'). Use when the system prompt's skill summary indicates this skill is \
         relevant to the current task."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The skill's command key, as listed in the system prompt"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    fn output_category(&self) -> OutputCategory {
        OutputCategory::FileContent
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let command = match call.args.get("command").and_then(|v| v.as_str()) {
            Some(c) => c,
            None => return ToolOutput::err(&call.id, "missing 'command'"),
        };

        let skills = self.skills.get();
        match skills.iter().find(|s| s.command == command) {
            Some(skill) => ToolOutput::ok(&call.id, skill.content.clone()),
            None => ToolOutput::err(&call.id, format!("no skill registered under '{command}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crush_runtime::SkillInfo;
    use serde_json::json;

    use super::*;

    fn make_skill(command: &str) -> SkillInfo {
        SkillInfo {
            command: command.to_string(),
            name: command.to_string(),
            description: "test skill".into(),
            version: None,
            skill_md_path: PathBuf::new(),
            skill_dir: PathBuf::new(),
            content: format!("instructions for {command}"),
            crush_meta: None,
        }
    }

    #[tokio::test]
    async fn loads_known_skill_body() {
        let skills = SharedSkills::new(vec![make_skill("crush")]);
        let tool = LoadSkillTool::new(skills);
        let out = tool
            .execute(&ToolCall {
                id: "k1".into(),
                name: "load_skill".into(),
                args: json!({"command": "crush"}),
            })
            .await;
        assert!(!out.is_error);
        assert!(out.content.contains("instructions for crush"));
    }

    #[tokio::test]
    async fn unknown_skill_is_error() {
        let skills = SharedSkills::empty();
        let tool = LoadSkillTool::new(skills);
        let out = tool
            .execute(&ToolCall {
                id: "k2".into(),
                name: "load_skill".into(),
                args: json!({"command": "nope"}),
            })
            .await;
        assert!(out.is_error);
    }
}
