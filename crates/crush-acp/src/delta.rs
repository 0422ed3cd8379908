// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Translates [`crush_store::MessageStore`] broker events into ACP
//! `sessionUpdate` notifications. See spec §4.G.
//!
//! `crush_store::Message::parts` is republished in full on every mutation
//! (it is not itself a delta stream), so this translator keeps its own
//! per-message byte offsets for the two parts that grow in place (`Text`,
//! `Reasoning`) and a small state machine per tool call so that `ToolCall`
//! start/update notifications are each emitted exactly once.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use agent_client_protocol::{
    AgentMessageChunk, AgentThoughtChunk, Client, ContentBlock, Diff, SessionId, SessionNotification,
    SessionUpdate, TextContent, ToolCall, ToolCallContent, ToolCallStatus, ToolCallUpdate,
    ToolCallUpdateFields, ToolKind, UserMessageChunk,
};
use tracing::warn;

use crush_broker::{Event, EventKind, Subscription};
use crush_store::{Message, Part, Role};

#[derive(Default)]
struct TextOffsets {
    text: usize,
    reasoning: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolCallPhase {
    Started,
    ArgsFinished,
    Completed,
}

/// Best-effort classification of a tool name into an ACP [`ToolKind`] for
/// display purposes. Mirrors `crush_tools::tool::ToolKind`'s variants but
/// operates on the bare tool name since the protocol adapter does not carry
/// a handle to the tool registry.
fn guess_kind(name: &str) -> ToolKind {
    let name = name.to_ascii_lowercase();
    if name.contains("edit") || name.contains("write") || name.contains("patch") {
        ToolKind::Edit
    } else if name.contains("exec") || name.contains("bash") || name.contains("shell") || name.contains("run") {
        ToolKind::Execute
    } else if name.contains("search") || name.contains("grep") || name.contains("glob") {
        ToolKind::Search
    } else if name.contains("fetch") || name.contains("http") || name.contains("web") {
        ToolKind::Fetch
    } else if name.contains("read") || name.contains("view") {
        ToolKind::Read
    } else {
        ToolKind::Other
    }
}

fn title_for(name: &str, input: &str) -> String {
    match serde_json::from_str::<serde_json::Value>(input) {
        Ok(serde_json::Value::Object(map)) => {
            for key in ["command", "path", "file_path", "pattern", "query", "url"] {
                if let Some(v) = map.get(key).and_then(|v| v.as_str()) {
                    return format!("{name}: {v}");
                }
            }
            name.to_string()
        }
        _ => name.to_string(),
    }
}

/// Per-session stream state. One instance is spawned per ACP session and
/// runs for the session's lifetime, draining `MessageStore` events as they
/// arrive.
pub struct DeltaTranslator {
    session_id: String,
    offsets: HashMap<String, TextOffsets>,
    tool_calls: HashMap<String, ToolCallPhase>,
    /// Session ids with a synthesized (not client-submitted) user message
    /// pending echo. Consumed the first time a `Role::User` text part is
    /// observed for that session, then the next one reverts to suppressed —
    /// matches the "suppressed once" wording in spec §4.G.
    echo_user: Arc<Mutex<HashSet<String>>>,
}

impl DeltaTranslator {
    pub fn new(session_id: String, echo_user: Arc<Mutex<HashSet<String>>>) -> Self {
        Self { session_id, offsets: HashMap::new(), tool_calls: HashMap::new(), echo_user }
    }

    /// Drain `messages` forever, pushing translated notifications to
    /// `client`. Returns when the broker subscription closes (process
    /// shutdown) — never on a transport error, which is logged and
    /// otherwise ignored so one bad notification doesn't tear down the
    /// whole session's stream (spec §4.G failure semantics).
    pub async fn run(mut self, mut messages: Subscription<Message>, client: Arc<dyn Client>) {
        while let Some(event) = messages.recv().await {
            if event.payload.session_id != self.session_id {
                continue;
            }
            self.handle(event, &client).await;
        }
    }

    async fn handle(&mut self, event: Event<Message>, client: &Arc<dyn Client>) {
        let message = event.payload;
        if event.kind == EventKind::Deleted {
            self.offsets.remove(&message.id);
            return;
        }

        for part in &message.parts {
            let update = match part {
                Part::Text { text } => self.text_delta(&message, text),
                Part::Reasoning { thinking } => self.reasoning_delta(&message, thinking),
                Part::ToolCall { id, name, input, finished } => {
                    self.tool_call_update(id, name, input, *finished)
                }
                Part::ToolResult { tool_call_id, content, metadata, is_error, .. } => {
                    self.tool_result_update(tool_call_id, content, metadata.as_ref(), *is_error)
                }
                Part::Finish { .. } => {
                    self.offsets.remove(&message.id);
                    None
                }
                Part::Binary { .. } | Part::ImageUrl { .. } => None,
            };
            if let Some(update) = update {
                self.notify(client, update).await;
            }
        }
    }

    async fn notify(&self, client: &Arc<dyn Client>, update: SessionUpdate) {
        let notification = SessionNotification::new(SessionId::from(self.session_id.as_str()), update);
        if let Err(e) = client.session_notification(notification).await {
            warn!(error = %e, session_id = %self.session_id, "sessionUpdate delivery failed, continuing");
        }
    }

    fn text_delta(&mut self, message: &Message, text: &str) -> Option<SessionUpdate> {
        let offsets = self.offsets.entry(message.id.clone()).or_default();
        if text.len() <= offsets.text {
            return None;
        }
        let delta = text[offsets.text..].to_string();
        offsets.text = text.len();

        if message.role == Role::User {
            let mut echo = self.echo_user.lock().expect("echo_user lock poisoned");
            if !echo.remove(&self.session_id) {
                return None;
            }
        }

        let block = ContentBlock::Text(TextContent::new(delta));
        Some(match message.role {
            Role::User => SessionUpdate::UserMessageChunk(UserMessageChunk::new(block)),
            _ => SessionUpdate::AgentMessageChunk(AgentMessageChunk::new(block)),
        })
    }

    fn reasoning_delta(&mut self, message: &Message, thinking: &str) -> Option<SessionUpdate> {
        let offsets = self.offsets.entry(message.id.clone()).or_default();
        if thinking.len() <= offsets.reasoning {
            return None;
        }
        let delta = thinking[offsets.reasoning..].to_string();
        offsets.reasoning = thinking.len();
        let block = ContentBlock::Text(TextContent::new(delta));
        Some(SessionUpdate::AgentThoughtChunk(AgentThoughtChunk::new(block)))
    }

    fn tool_call_update(&mut self, id: &str, name: &str, input: &str, finished: bool) -> Option<SessionUpdate> {
        match self.tool_calls.get(id).copied() {
            None => {
                self.tool_calls.insert(id.to_string(), ToolCallPhase::Started);
                let call = ToolCall::new(id, title_for(name, input))
                    .kind(guess_kind(name))
                    .status(ToolCallStatus::Pending);
                Some(SessionUpdate::ToolCall(call))
            }
            Some(ToolCallPhase::Started) if finished => {
                self.tool_calls.insert(id.to_string(), ToolCallPhase::ArgsFinished);
                let fields = ToolCallUpdateFields::new()
                    .title(title_for(name, input))
                    .status(ToolCallStatus::InProgress);
                Some(SessionUpdate::ToolCallUpdate(ToolCallUpdate::new(id, fields)))
            }
            _ => None,
        }
    }

    fn tool_result_update(
        &mut self,
        tool_call_id: &str,
        content: &str,
        metadata: Option<&serde_json::Value>,
        is_error: bool,
    ) -> Option<SessionUpdate> {
        if self.tool_calls.get(tool_call_id).copied() == Some(ToolCallPhase::Completed) {
            return None;
        }
        self.tool_calls.insert(tool_call_id.to_string(), ToolCallPhase::Completed);

        let status = if is_error { ToolCallStatus::Failed } else { ToolCallStatus::Completed };
        let body = edit_diff(metadata)
            .map(|diff| vec![ToolCallContent::Diff(diff)])
            .unwrap_or_else(|| vec![ContentBlock::Text(TextContent::new(content.to_string())).into()]);

        let fields = ToolCallUpdateFields::new().status(status).content(body);
        Some(SessionUpdate::ToolCallUpdate(ToolCallUpdate::new(tool_call_id, fields)))
    }
}

/// If `metadata` carries the `{file_path, old_content, new_content}` shape
/// edit-class tools attach to their result, build an ACP diff content block
/// instead of rendering the raw tool output as text.
fn edit_diff(metadata: Option<&serde_json::Value>) -> Option<Diff> {
    let meta = metadata?.as_object()?;
    let path = meta.get("file_path")?.as_str()?;
    let old_text = meta.get("old_content").and_then(|v| v.as_str()).map(str::to_string);
    let new_text = meta.get("new_content")?.as_str()?.to_string();
    Some(Diff::new(PathBuf::from(path), new_text).old_text(old_text.unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_emits_only_the_new_suffix() {
        let mut translator = DeltaTranslator::new("s1".into(), Arc::new(Mutex::new(HashSet::new())));
        let msg = Message {
            id: "m1".into(),
            session_id: "s1".into(),
            role: Role::Assistant,
            parts: vec![],
            provider: None,
            model: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let first = translator.text_delta(&msg, "Hello").unwrap();
        match first {
            SessionUpdate::AgentMessageChunk(chunk) => {
                let ContentBlock::Text(t) = chunk.content else { panic!("expected text block") };
                assert_eq!(t.text, "Hello");
            }
            _ => panic!("expected agent message chunk"),
        }
        let second = translator.text_delta(&msg, "Hello, world").unwrap();
        match second {
            SessionUpdate::AgentMessageChunk(chunk) => {
                let ContentBlock::Text(t) = chunk.content else { panic!("expected text block") };
                assert_eq!(t.text, ", world");
            }
            _ => panic!("expected agent message chunk"),
        }
        assert!(translator.text_delta(&msg, "Hello, world").is_none());
    }

    #[test]
    fn tool_call_start_then_single_in_progress_update() {
        let mut translator = DeltaTranslator::new("s1".into(), Arc::new(Mutex::new(HashSet::new())));
        let start = translator.tool_call_update("tc1", "bash", "{\"command\":", false);
        assert!(matches!(start, Some(SessionUpdate::ToolCall(_))));
        assert!(translator.tool_call_update("tc1", "bash", "{\"command\":", false).is_none());
        let update = translator.tool_call_update("tc1", "bash", "{\"command\":\"ls\"}", true);
        assert!(matches!(update, Some(SessionUpdate::ToolCallUpdate(_))));
        assert!(translator.tool_call_update("tc1", "bash", "{\"command\":\"ls\"}", true).is_none());
    }

    #[test]
    fn tool_result_terminal_update_is_emitted_once() {
        let mut translator = DeltaTranslator::new("s1".into(), Arc::new(Mutex::new(HashSet::new())));
        translator.tool_call_update("tc1", "bash", "{}", true);
        let first = translator.tool_result_update("tc1", "ok", None, false);
        assert!(matches!(first, Some(SessionUpdate::ToolCallUpdate(_))));
        assert!(translator.tool_result_update("tc1", "ok", None, false).is_none());
    }

    #[test]
    fn user_text_is_suppressed_unless_echo_is_armed() {
        let echo = Arc::new(Mutex::new(HashSet::new()));
        let mut translator = DeltaTranslator::new("s1".into(), echo.clone());
        let msg = Message {
            id: "m1".into(),
            session_id: "s1".into(),
            role: Role::User,
            parts: vec![],
            provider: None,
            model: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(translator.text_delta(&msg, "ordinary prompt").is_none());

        echo.lock().unwrap().insert("s1".to_string());
        let msg2 = Message { id: "m2".into(), ..msg };
        let emitted = translator.text_delta(&msg2, "/init").unwrap();
        assert!(matches!(emitted, SessionUpdate::UserMessageChunk(_)));
        // the flag is consumed, so a further synthesized message on the
        // same session is suppressed again until re-armed
        let msg3 = Message { id: "m3".into(), ..msg2 };
        assert!(translator.text_delta(&msg3, "another").is_none());
    }
}
