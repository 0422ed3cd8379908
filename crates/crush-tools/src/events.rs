/// A structured todo item managed by the todo_write tool.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    /// One of: "pending", "in_progress", "completed", "cancelled"
    pub status: String,
}

/// Events emitted by tools to communicate state changes back to the agent loop.
/// The coordinator translates these into broker-published session events.
#[derive(Debug)]
pub enum ToolEvent {
    TodoUpdate(Vec<TodoItem>),
    ModeChanged(crush_config::AgentMode),
}

/// A question the agent wants to put to whoever is driving the session
/// (interactive TUI user, or the ACP client on the other end of the wire).
///
/// Sent by [`crate::AskQuestionTool`] over the channel given to
/// `AskQuestionTool::new_tui`; the receiver answers by sending a single
/// string back over `answer_tx`.  Dropping `answer_tx` without sending
/// (e.g. the session was cancelled) unblocks the tool call with an error.
#[derive(Debug)]
pub struct QuestionRequest {
    pub id: String,
    pub questions: Vec<String>,
    pub answer_tx: tokio::sync::oneshot::Sender<String>,
}
