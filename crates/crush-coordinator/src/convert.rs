// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bridges the persisted, tagged-part [`crush_store::Message`] shape to the
//! single-content-variant [`crush_model::Message`] shape the model loop
//! actually drives.
//!
//! One stored message may carry several parts (text, a tool call, a second
//! tool call); the model wire format wants each of those as its own
//! message. The reverse direction (model loop → store) is handled directly
//! in [`crate::Coordinator`] as events stream off the agent, since that path
//! needs incremental append/update-tail semantics this module has no part in.

use crush_model::{ContentPart, FunctionCall, Message as ModelMessage, MessageContent};
use crush_store::{Message as StoreMessage, Part, Role as StoreRole};

/// Flatten one persisted message into zero or more model messages.
///
/// - `Text` and `Reasoning` parts collapse into a single text message per
///   role (reasoning has no wire representation on replay, so it is folded
///   into the surrounding text rather than dropped silently).
/// - Each `ToolCall` part becomes its own assistant message.
/// - Each `ToolResult` part becomes its own tool message.
/// - `Binary` / `ImageUrl` parts on a user message become image content
///   parts; elsewhere they are dropped (no model-message shape carries them).
/// - `Finish` carries no model content.
fn flatten_message(msg: &StoreMessage) -> Vec<ModelMessage> {
    let mut out = Vec::new();
    let mut text = String::new();
    let mut images: Vec<ContentPart> = Vec::new();

    for part in &msg.parts {
        match part {
            Part::Text { text: t } => text.push_str(t),
            Part::Reasoning { thinking } => text.push_str(thinking),
            Part::ToolCall { id, name, input, .. } => {
                out.push(ModelMessage {
                    role: role_of(msg.role),
                    content: MessageContent::ToolCall {
                        tool_call_id: id.clone(),
                        function: FunctionCall { name: name.clone(), arguments: input.clone() },
                    },
                });
            }
            Part::ToolResult { tool_call_id, content, .. } => {
                out.push(ModelMessage::tool_result(tool_call_id, content.clone()));
            }
            Part::ImageUrl { url, .. } => images.push(ContentPart::image(url.clone())),
            Part::Binary { mime_type, data } => {
                images.push(ContentPart::image(format!("data:{mime_type};base64,{data}")))
            }
            Part::Finish { .. } => {}
        }
    }

    if !text.is_empty() || !images.is_empty() {
        let leading = if images.is_empty() {
            ModelMessage { role: role_of(msg.role), content: MessageContent::Text(text) }
        } else if msg.role == StoreRole::User {
            let mut parts = Vec::with_capacity(images.len() + 1);
            if !text.is_empty() {
                parts.push(ContentPart::text(text));
            }
            parts.extend(images);
            ModelMessage::user_with_parts(parts)
        } else {
            ModelMessage { role: role_of(msg.role), content: MessageContent::Text(text) }
        };
        // Tool-call/tool-result messages constructed above must come after the
        // text content only when the store ordered them that way; in practice
        // a message is either pure text/reasoning or a set of tool calls, so
        // prepending here preserves the store's part order.
        out.insert(0, leading);
    }

    out
}

fn role_of(role: StoreRole) -> crush_model::Role {
    match role {
        StoreRole::User => crush_model::Role::User,
        StoreRole::Assistant => crush_model::Role::Assistant,
        StoreRole::Tool => crush_model::Role::Tool,
        StoreRole::System => crush_model::Role::System,
    }
}

/// Assemble model input from persisted history, per §4.F step 2b: the
/// system message is injected separately by `crush_core::Agent`, so this
/// only needs to produce the summarized-prefix-then-tail message list.
///
/// `summary_message_id`, when set, names a message in `history` whose sole
/// `Text` part is a standing summary of everything at or before it; messages
/// at or before that point are dropped from the replay and replaced by the
/// summary text as a single leading user message. Messages after it are
/// replayed in full.
pub fn assemble_model_history(
    history: &[StoreMessage],
    summary_message_id: Option<&str>,
) -> Vec<ModelMessage> {
    let tail: &[StoreMessage] = match summary_message_id {
        Some(id) => match history.iter().position(|m| m.id == id) {
            Some(idx) => &history[idx + 1..],
            None => history,
        },
        None => history,
    };

    let mut out = Vec::new();
    if let Some(id) = summary_message_id {
        if let Some(summary_msg) = history.iter().find(|m| m.id == id) {
            let summary_text: String = summary_msg
                .parts
                .iter()
                .filter_map(|p| match p {
                    Part::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n");
            if !summary_text.is_empty() {
                out.push(ModelMessage::user(format!(
                    "[Summary of earlier conversation]\n\n{summary_text}"
                )));
            }
        }
    }

    for msg in tail {
        out.extend(flatten_message(msg));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crush_store::FinishReason;

    fn msg(id: &str, role: StoreRole, parts: Vec<Part>) -> StoreMessage {
        StoreMessage {
            id: id.to_string(),
            session_id: "s1".to_string(),
            role,
            parts,
            provider: None,
            model: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn flattens_plain_text_message() {
        let m = msg("m1", StoreRole::User, vec![Part::Text { text: "hello".into() }]);
        let out = flatten_message(&m);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_text(), Some("hello"));
    }

    #[test]
    fn splits_tool_call_into_its_own_message() {
        let m = msg(
            "m2",
            StoreRole::Assistant,
            vec![
                Part::Text { text: "thinking...".into() },
                Part::ToolCall { id: "c1".into(), name: "read_file".into(), input: "{}".into(), finished: true },
            ],
        );
        let out = flatten_message(&m);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[1].content, MessageContent::ToolCall { .. }));
    }

    #[test]
    fn tool_result_part_becomes_tool_message() {
        let m = msg(
            "m3",
            StoreRole::Tool,
            vec![Part::ToolResult {
                tool_call_id: "c1".into(),
                name: "read_file".into(),
                content: "contents".into(),
                metadata: None,
                is_error: false,
            }],
        );
        let out = flatten_message(&m);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].content, MessageContent::ToolResult { .. }));
    }

    #[test]
    fn finish_only_message_produces_nothing() {
        let m = msg(
            "m4",
            StoreRole::Assistant,
            vec![Part::Finish { reason: FinishReason::EndTurn, timestamp: Utc::now() }],
        );
        assert!(flatten_message(&m).is_empty());
    }

    #[test]
    fn assemble_without_summary_replays_everything() {
        let history = vec![
            msg("m1", StoreRole::User, vec![Part::Text { text: "hi".into() }]),
            msg("m2", StoreRole::Assistant, vec![Part::Text { text: "hello".into() }]),
        ];
        let out = assemble_model_history(&history, None);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn assemble_with_summary_drops_prefix_and_prepends_summary_text() {
        let history = vec![
            msg("m1", StoreRole::User, vec![Part::Text { text: "old".into() }]),
            msg("m2", StoreRole::Assistant, vec![Part::Text { text: "summary of old stuff".into() }]),
            msg("m3", StoreRole::User, vec![Part::Text { text: "new question".into() }]),
        ];
        let out = assemble_model_history(&history, Some("m2"));
        assert_eq!(out.len(), 2);
        assert!(out[0].as_text().unwrap().contains("summary of old stuff"));
        assert_eq!(out[1].as_text(), Some("new question"));
    }

    #[test]
    fn assemble_with_unknown_summary_id_falls_back_to_full_replay() {
        let history = vec![msg("m1", StoreRole::User, vec![Part::Text { text: "hi".into() }])];
        let out = assemble_model_history(&history, Some("missing"));
        assert_eq!(out.len(), 1);
    }
}
