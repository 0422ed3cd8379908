// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use crate::events::QuestionRequest;
use crate::policy::ApprovalPolicy;
use crate::tool::{Tool, ToolCall, ToolOutput};

/// Lets the agent pause a turn and ask the human (or ACP client) a
/// clarifying question.
///
/// Without a channel (sub-agent / headless context) the question cannot be
/// routed anywhere, so the tool fails fast rather than blocking forever.
pub struct AskQuestionTool {
    tx: Option<mpsc::Sender<QuestionRequest>>,
}

impl AskQuestionTool {
    /// No interactive surface available; every call fails immediately.
    pub fn new() -> Self {
        Self { tx: None }
    }

    /// Routes questions to whatever is listening on the other end of `tx`
    /// (the coordinator bridges this to an ACP `session/request_permission`-
    /// style prompt or a TUI modal).
    pub fn new_tui(tx: mpsc::Sender<QuestionRequest>) -> Self {
        Self { tx: Some(tx) }
    }
}

impl Default for AskQuestionTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for AskQuestionTool {
    fn name(&self) -> &str {
        "ask_question"
    }

    fn description(&self) -> &str {
        "Ask the user one or more clarifying questions and wait for their answer before \
         continuing. Use sparingly — prefer making a reasonable assumption and noting it, \
         unless the ambiguity is load-bearing for the rest of the task."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "One or more questions to put to the user"
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Auto
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let questions: Vec<String> = match call.args.get("questions").and_then(|v| v.as_array()) {
            Some(arr) => arr
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            None => return ToolOutput::err(&call.id, "missing 'questions' array"),
        };
        if questions.is_empty() {
            return ToolOutput::err(&call.id, "'questions' must contain at least one entry");
        }

        let Some(tx) = &self.tx else {
            return ToolOutput::err(
                &call.id,
                "no interactive surface available to ask a question in this context",
            );
        };

        let (answer_tx, answer_rx) = oneshot::channel();
        let request = QuestionRequest {
            id: call.id.clone(),
            questions,
            answer_tx,
        };
        if tx.send(request).await.is_err() {
            return ToolOutput::err(&call.id, "question channel closed");
        }

        match answer_rx.await {
            Ok(answer) => ToolOutput::ok(&call.id, answer),
            Err(_) => ToolOutput::err(&call.id, "no answer received (session ended)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(args: Value) -> ToolCall {
        ToolCall {
            id: "q1".into(),
            name: "ask_question".into(),
            args,
        }
    }

    #[tokio::test]
    async fn headless_fails_fast() {
        let tool = AskQuestionTool::new();
        let out = tool
            .execute(&call(json!({"questions": ["pick one?"]})))
            .await;
        assert!(out.is_error);
        assert!(out.content.contains("no interactive surface"));
    }

    #[tokio::test]
    async fn missing_questions_is_error() {
        let tool = AskQuestionTool::new();
        let out = tool.execute(&call(json!({}))).await;
        assert!(out.is_error);
    }

    #[tokio::test]
    async fn routes_question_and_awaits_answer() {
        let (tx, mut rx) = mpsc::channel(1);
        let tool = AskQuestionTool::new_tui(tx);

        let handle = tokio::spawn(async move {
            tool.execute(&call(json!({"questions": ["continue?"]})))
                .await
        });

        let req = rx.recv().await.expect("question sent");
        assert_eq!(req.questions, vec!["continue?".to_string()]);
        req.answer_tx.send("yes".into()).unwrap();

        let out = handle.await.unwrap();
        assert!(!out.is_error);
        assert_eq!(out.content, "yes");
    }
}
