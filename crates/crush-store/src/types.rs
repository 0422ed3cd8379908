use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tagged fragment of a [`Message`]. See spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        /// The complete accumulated string, not just the latest delta.
        text: String,
    },
    Reasoning {
        thinking: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// JSON string of arguments, grows as the model streams them.
        input: String,
        finished: bool,
    },
    ToolResult {
        tool_call_id: String,
        name: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
        is_error: bool,
    },
    Finish {
        reason: FinishReason,
        timestamp: DateTime<Utc>,
    },
    Binary {
        mime_type: String,
        /// Base64-encoded payload.
        data: String,
    },
    ImageUrl {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl Part {
    pub fn is_finish(&self) -> bool {
        matches!(self, Part::Finish { .. })
    }

    /// True when `other` would naturally replace `self` in place under
    /// `UpdateTailPart` (same streaming slot), rather than being appended as
    /// a new part.
    pub fn same_slot_as(&self, other: &Part) -> bool {
        match (self, other) {
            (Part::Text { .. }, Part::Text { .. }) => true,
            (Part::Reasoning { .. }, Part::Reasoning { .. }) => true,
            (
                Part::ToolCall { id: a, .. },
                Part::ToolCall { id: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolCalls,
    MaxTokens,
    Error,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
            Role::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "tool" => Some(Role::Tool),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// An append-only, eventually-immutable message within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub role: Role,
    pub parts: Vec<Part>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn is_finished(&self) -> bool {
        self.parts.iter().any(Part::is_finish)
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.parts.iter().find_map(|p| match p {
            Part::Finish { reason, .. } => Some(*reason),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoEntry {
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
}

/// A conversation. Identity is `id`; `parent_id` is set only by `Fork`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub parent_id: Option<String>,
    pub title: String,
    pub summary_message_id: Option<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    pub cost: f64,
    pub todos: Vec<TodoEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A previously-recorded snapshot of a file's content as last read by an
/// edit-class tool, used to detect concurrent modification out from under
/// the agent. See spec §6 `files` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileVersion {
    pub session_id: String,
    pub path: String,
    pub version: i64,
    pub content: Option<String>,
    pub recorded_at: DateTime<Utc>,
}
