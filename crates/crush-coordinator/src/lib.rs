// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Agent Coordinator: one turn loop per session, FIFO queueing (or turn
//! interruption), cancellation, explicit summarization, and fork-on-resume.
//!
//! The coordinator owns no conversation state of its own — every turn
//! rebuilds its model input fresh from [`crush_store::SessionStore`] /
//! [`crush_store::MessageStore`] (see [`convert::assemble_model_history`]),
//! runs a freshly-built `crush_core::Agent` over it, and streams the
//! resulting `AgentEvent`s back into the stores as they arrive. This keeps
//! the persisted database the single source of truth: a crash mid-turn
//! leaves a partial-but-consistent message behind, and a fresh process can
//! resume a session without replaying any in-memory coordinator state.

mod convert;
mod events;
pub mod gate;

pub use events::CoordinatorEvent;
pub use gate::ArbiterGate;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crush_bootstrap::{AgentBuilder, RuntimeContext, ToolSetProfile};
use crush_broker::{Broker, Event};
use crush_config::{AgentMode, Config};
use crush_core::AgentEvent;
use crush_model::ModelProvider;
use crush_permission::PermissionArbiter;
use crush_store::{Db, FinishReason, MessageStore, Part, Role, Session, SessionStore, StoreError};
use crush_tools::{events::QuestionRequest, events::TodoItem, ToolPolicy};

/// Whether a second `Run` for a session already mid-turn is queued behind
/// the active one, or preempts it. See spec §4.F step 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Queue,
    Interrupt,
}

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("model error: {0}")]
    Model(#[from] anyhow::Error),
    #[error("request cancelled")]
    Cancelled,
    #[error("superseded by a newer prompt")]
    Superseded,
}

/// Summary of how one turn ended, returned over the `Run` `done` channel.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session_id: String,
    pub assistant_message_id: String,
    pub finish_reason: FinishReason,
    pub tool_call_count: usize,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_read_tokens: u32,
    pub cache_write_tokens: u32,
    pub cost: f64,
}

type TurnResult = Result<TurnOutcome, CoordinatorError>;

struct QueuedPrompt {
    prompt: String,
    responder: oneshot::Sender<TurnResult>,
}

/// Cancellation handles for the turn currently running. `cancel_tx` is taken
/// (leaving `None`) the first time the turn is cancelled, so a second cancel
/// request against the same turn is a cheap no-op rather than a double-send.
struct ActiveTurn {
    cancel_tx: Option<oneshot::Sender<()>>,
    perm_cancel: CancellationToken,
}

#[derive(Default)]
struct SessionTurns {
    /// Handle for the turn currently running, if any.
    active: Option<ActiveTurn>,
    /// Interrupt-mode: the prompt waiting to replace the active turn once it
    /// unwinds. Only ever one deep — a second interrupt while one is already
    /// pending supersedes the first.
    pending_interrupt: Option<QueuedPrompt>,
    /// Queue-mode: FIFO backlog.
    queue: VecDeque<QueuedPrompt>,
}

/// Owns the turn loop for every session. Cheap to share: wrap in `Arc` and
/// clone the `Arc`, not the coordinator itself.
pub struct Coordinator {
    config: Arc<Config>,
    model: Arc<dyn ModelProvider>,
    runtime_ctx: RuntimeContext,
    sessions: SessionStore,
    messages: Arc<MessageStore>,
    arbiter: Arc<PermissionArbiter>,
    events: Broker<CoordinatorEvent>,
    question_tx: Option<mpsc::Sender<QuestionRequest>>,
    queue_mode: QueueMode,
    modes: Mutex<HashMap<String, AgentMode>>,
    turns: Mutex<HashMap<String, SessionTurns>>,
}

impl Coordinator {
    /// Construct from already-open stores, an arbiter, and a model provider.
    /// Embedding applications that manage their own `Db` lifecycle (e.g. to
    /// share one connection pool across multiple coordinators) should use
    /// this directly; [`Coordinator::open`] is the common-case convenience
    /// path.
    pub fn new(
        config: Arc<Config>,
        model: Arc<dyn ModelProvider>,
        runtime_ctx: RuntimeContext,
        sessions: SessionStore,
        messages: Arc<MessageStore>,
        arbiter: Arc<PermissionArbiter>,
        queue_mode: QueueMode,
        question_tx: Option<mpsc::Sender<QuestionRequest>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            model,
            runtime_ctx,
            sessions,
            messages,
            arbiter,
            events: Broker::new(crush_broker::DEFAULT_CAPACITY),
            question_tx,
            queue_mode,
            modes: Mutex::new(HashMap::new()),
            turns: Mutex::new(HashMap::new()),
        })
    }

    /// Open the embedded database at `config.store.db_path` (resolved
    /// against `XDG_DATA_HOME` when relative) and wire up fresh
    /// `SessionStore` / `MessageStore` / `PermissionArbiter` instances.
    pub fn open(
        config: Arc<Config>,
        model: Arc<dyn ModelProvider>,
        runtime_ctx: RuntimeContext,
        queue_mode: QueueMode,
        question_tx: Option<mpsc::Sender<QuestionRequest>>,
    ) -> anyhow::Result<Arc<Self>> {
        let db_path = resolve_db_path(&config.store.db_path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Db::open(&db_path)?;
        let buf = config.broker.subscriber_buffer_size;
        let sessions = SessionStore::new(db.clone(), Arc::new(Broker::new(buf)));
        let messages = Arc::new(MessageStore::new(db, Arc::new(Broker::new(buf))));
        let arbiter = Arc::new(PermissionArbiter::from_config(&config.permission));
        Ok(Self::new(config, model, runtime_ctx, sessions, messages, arbiter, queue_mode, question_tx))
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn messages(&self) -> &MessageStore {
        &self.messages
    }

    pub fn arbiter(&self) -> &Arc<PermissionArbiter> {
        &self.arbiter
    }

    pub fn subscribe_events(&self) -> crush_broker::Subscription<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Current mode for `session_id` (defaults to [`AgentMode::Agent`] the
    /// first time a session is seen). Read at the start of every turn and
    /// updated live from `AgentEvent::ModeChanged` / explicit
    /// `set_mode` calls (the ACP adapter's `setSessionMode`).
    pub async fn mode(&self, session_id: &str) -> AgentMode {
        self.modes.lock().await.get(session_id).copied().unwrap_or_default()
    }

    pub async fn set_mode(&self, session_id: &str, mode: AgentMode) {
        self.modes.lock().await.insert(session_id.to_string(), mode);
    }

    /// Submit a prompt for `session_id`. See spec §4.F step 1 for the
    /// queue/interrupt semantics. The returned receiver resolves when the
    /// turn this prompt eventually runs as completes (immediately, if
    /// queued behind others that each run to completion first).
    pub async fn run(
        self: &Arc<Self>,
        session_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> oneshot::Receiver<TurnResult> {
        let session_id = session_id.into();
        let prompt = prompt.into();
        let (tx, rx) = oneshot::channel();

        let mut turns = self.turns.lock().await;
        let entry = turns.entry(session_id.clone()).or_default();
        if let Some(active) = entry.active.as_mut() {
            match self.queue_mode {
                QueueMode::Queue => {
                    entry.queue.push_back(QueuedPrompt { prompt, responder: tx });
                    return rx;
                }
                QueueMode::Interrupt => {
                    if let Some(cancel_tx) = active.cancel_tx.take() {
                        let _ = cancel_tx.send(());
                    }
                    active.perm_cancel.cancel();
                    if let Some(superseded) =
                        entry.pending_interrupt.replace(QueuedPrompt { prompt, responder: tx })
                    {
                        let _ = superseded.responder.send(Err(CoordinatorError::Superseded));
                    }
                    return rx;
                }
            }
        }
        drop(turns);

        self.clone().spawn_turn(session_id, QueuedPrompt { prompt, responder: tx });
        rx
    }

    fn spawn_turn(self: Arc<Self>, session_id: String, queued: QueuedPrompt) {
        tokio::spawn(async move {
            let (cancel_tx, cancel_rx) = oneshot::channel();
            let perm_cancel = CancellationToken::new();
            {
                let mut turns = self.turns.lock().await;
                let entry = turns.entry(session_id.clone()).or_default();
                entry.active = Some(ActiveTurn { cancel_tx: Some(cancel_tx), perm_cancel: perm_cancel.clone() });
            }

            let result = self.run_one_turn(&session_id, &queued.prompt, cancel_rx, perm_cancel).await;
            let _ = queued.responder.send(result);
            self.finish_turn(session_id).await;
        });
    }

    /// Called when a turn unwinds (success, error, or cancellation): clears
    /// the active-turn handle and, if anything queued up behind it, starts
    /// the next one. Runs strictly after the previous turn has finished
    /// writing to the store, so there is never more than one writer per
    /// session in flight.
    async fn finish_turn(self: Arc<Self>, session_id: String) {
        let next = {
            let mut turns = self.turns.lock().await;
            let Some(entry) = turns.get_mut(&session_id) else { return };
            entry.active = None;
            entry.pending_interrupt.take().or_else(|| entry.queue.pop_front())
        };
        if let Some(queued) = next {
            self.spawn_turn(session_id, queued);
        }
    }

    /// Cancel the active turn for `session_id`, if any. No-op if the
    /// session has no turn in flight.
    pub async fn cancel(&self, session_id: &str) {
        // Deny outstanding permission requests first so the tool loop's
        // `request()` calls resolve immediately rather than waiting for the
        // cancellation token to propagate through `tokio::select!`.
        self.arbiter.deny_all_for_session(session_id);

        let cancel_tx = {
            let mut turns = self.turns.lock().await;
            let Some(active) = turns.get_mut(session_id).and_then(|e| e.active.as_mut()) else {
                return;
            };
            active.perm_cancel.cancel();
            active.cancel_tx.take()
        };
        if let Some(tx) = cancel_tx {
            let _ = tx.send(());
        }
    }

    async fn run_one_turn(
        self: &Arc<Self>,
        session_id: &str,
        prompt: &str,
        cancel_rx: oneshot::Receiver<()>,
        perm_cancel: CancellationToken,
    ) -> TurnResult {
        let session = self
            .sessions
            .get(session_id)
            .await?
            .ok_or_else(|| CoordinatorError::SessionNotFound(session_id.to_string()))?;

        let history = self.messages.list(session_id).await?;
        let model_history =
            convert::assemble_model_history(&history, session.summary_message_id.as_deref());

        self.messages
            .create(session_id, Role::User, vec![Part::Text { text: prompt.to_string() }], None, None)
            .await?;

        let assistant_msg = self
            .messages
            .create(
                session_id,
                Role::Assistant,
                vec![],
                Some(self.model.name().to_string()),
                Some(self.model.model_name().to_string()),
            )
            .await?;

        let mode = self.mode(session_id).await;
        let policy = ToolPolicy::from_config(&self.config.tools);
        let gate: Arc<dyn crush_tools::PermissionGate> =
            Arc::new(ArbiterGate::new(policy, self.arbiter.clone(), perm_cancel));

        let mut agent = AgentBuilder::new(self.config.clone())
            .with_runtime_context(self.runtime_ctx.clone())
            .with_permission_gate(session_id.to_string(), gate)
            .build(mode, self.model.clone(), self.tool_profile(&session));

        agent.seed_history(model_history).await;

        let (tx, rx) = mpsc::channel::<AgentEvent>(64);
        let session_id_owned = session_id.to_string();
        let assistant_id = assistant_msg.id.clone();
        let this = self.clone();
        let drain = tokio::spawn(async move {
            this.drain_turn_events(session_id_owned, assistant_id, rx).await
        });

        let submit_result = agent.submit_with_cancel(prompt, tx, cancel_rx).await;
        let turn_state = drain.await.map_err(|e| {
            CoordinatorError::Model(anyhow::anyhow!("turn event drain task panicked: {e}"))
        })?;

        if let Err(e) = submit_result {
            self.finalize_message(&assistant_msg.id, FinishReason::Error).await.ok();
            return Err(CoordinatorError::Model(e));
        }

        self.messages.finish(&assistant_msg.id, turn_state.finish_reason).await?;

        let mut updated = session;
        updated.prompt_tokens += turn_state.input_tokens as u64;
        updated.completion_tokens += turn_state.output_tokens as u64;
        updated.cache_read_tokens += turn_state.cache_read_tokens as u64;
        updated.cache_write_tokens += turn_state.cache_write_tokens as u64;
        updated.cost += turn_state.cost;
        if let Some(todos) = turn_state.todos {
            updated.todos = todos;
        }
        self.sessions.update(&updated).await?;

        Ok(TurnOutcome {
            session_id: session_id.to_string(),
            assistant_message_id: assistant_msg.id,
            finish_reason: turn_state.finish_reason,
            tool_call_count: turn_state.tool_call_count,
            input_tokens: turn_state.input_tokens,
            output_tokens: turn_state.output_tokens,
            cache_read_tokens: turn_state.cache_read_tokens,
            cache_write_tokens: turn_state.cache_write_tokens,
            cost: turn_state.cost,
        })
    }

    /// USD estimate for one usage update, from the active model's configured
    /// per-1k-token rates. Cache-read/write tokens are not separately priced
    /// (the configured rates are the provider's standard input/output price);
    /// providers without configured rates (including the mock driver) cost 0.
    fn estimated_cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        let in_rate = self.config.model.cost_per_1k_input_tokens.unwrap_or(0.0);
        let out_rate = self.config.model.cost_per_1k_output_tokens.unwrap_or(0.0);
        (input_tokens as f64 / 1000.0) * in_rate + (output_tokens as f64 / 1000.0) * out_rate
    }

    fn tool_profile(&self, session: &Session) -> ToolSetProfile {
        ToolSetProfile::Full {
            question_tx: self.question_tx.clone(),
            todos: Arc::new(Mutex::new(todo_entries_to_items(&session.todos))),
            task_depth: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
        }
    }

    async fn finalize_message(&self, message_id: &str, reason: FinishReason) -> Result<(), StoreError> {
        match self.messages.finish(message_id, reason).await {
            Ok(_) | Err(StoreError::MessageFinished(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Drain `AgentEvent`s off a running turn, mirroring each one into the
    /// message store (text/reasoning/tool-call deltas, tool results) or the
    /// coordinator event broker (todos, mode changes, compaction, questions)
    /// as appropriate. Returns accumulated per-turn bookkeeping once `rx`
    /// closes.
    async fn drain_turn_events(
        self: Arc<Self>,
        session_id: String,
        assistant_message_id: String,
        mut rx: mpsc::Receiver<AgentEvent>,
    ) -> TurnDrainState {
        let mut state = TurnDrainState {
            finish_reason: FinishReason::EndTurn,
            tool_call_count: 0,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_write_tokens: 0,
            cost: 0.0,
            todos: None,
        };
        let mut text = String::new();
        let mut reasoning = String::new();

        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(d) => {
                    text.push_str(&d);
                    if let Err(e) = self
                        .messages
                        .update_tail_part(&assistant_message_id, Part::Text { text: text.clone() })
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist text delta");
                    }
                }
                AgentEvent::ThinkingDelta(d) => {
                    reasoning.push_str(&d);
                    if let Err(e) = self
                        .messages
                        .update_tail_part(&assistant_message_id, Part::Reasoning { thinking: reasoning.clone() })
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist reasoning delta");
                    }
                }
                AgentEvent::ThinkingComplete(full) => {
                    reasoning = full;
                }
                AgentEvent::TextComplete(full) => {
                    text = full.clone();
                    if let Err(e) = self
                        .messages
                        .update_tail_part(&assistant_message_id, Part::Text { text: full })
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist text completion");
                    }
                }
                AgentEvent::ToolCallStarted(call) => {
                    state.tool_call_count += 1;
                    if let Err(e) = self
                        .messages
                        .append(
                            &assistant_message_id,
                            Part::ToolCall {
                                id: call.id.clone(),
                                name: call.name.clone(),
                                input: call.args.to_string(),
                                finished: true,
                            },
                        )
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist tool call");
                    }
                }
                AgentEvent::ToolCallFinished { call_id, tool_name, output, metadata, is_error } => {
                    if let Err(e) = self
                        .messages
                        .create(
                            &session_id,
                            Role::Tool,
                            vec![Part::ToolResult {
                                tool_call_id: call_id,
                                name: tool_name,
                                content: output,
                                metadata,
                                is_error,
                            }],
                            None,
                            None,
                        )
                        .await
                    {
                        warn!(%session_id, error = %e, "failed to persist tool result");
                    }
                }
                AgentEvent::ContextCompacted { tokens_before, tokens_after } => {
                    self.events.publish(Event::updated(CoordinatorEvent::ContextCompacted {
                        session_id: session_id.clone(),
                        tokens_before,
                        tokens_after,
                    }));
                }
                AgentEvent::TokenUsage { input, output, cache_read, cache_write, .. } => {
                    state.input_tokens += input;
                    state.output_tokens += output;
                    state.cache_read_tokens += cache_read;
                    state.cache_write_tokens += cache_write;
                    state.cost += self.estimated_cost(input, output);
                }
                AgentEvent::TurnComplete => {
                    state.finish_reason = FinishReason::EndTurn;
                }
                AgentEvent::Error(msg) => {
                    warn!(%session_id, %msg, "recoverable agent error during turn");
                }
                AgentEvent::TodoUpdate(items) => {
                    state.todos = Some(todo_items_to_entries(&items));
                    self.events.publish(Event::updated(CoordinatorEvent::TodoUpdated {
                        session_id: session_id.clone(),
                        todos: items,
                    }));
                }
                AgentEvent::ModeChanged(mode) => {
                    self.set_mode(&session_id, mode).await;
                    self.events.publish(Event::updated(CoordinatorEvent::ModeChanged {
                        session_id: session_id.clone(),
                        mode,
                    }));
                }
                AgentEvent::Question { id, questions } => {
                    self.events.publish(Event::created(CoordinatorEvent::Question {
                        session_id: session_id.clone(),
                        id,
                        questions,
                    }));
                }
                AgentEvent::QuestionAnswer { .. } => {}
                AgentEvent::Aborted { partial_text } => {
                    if !partial_text.is_empty() {
                        let _ = self
                            .messages
                            .update_tail_part(&assistant_message_id, Part::Text { text: partial_text })
                            .await;
                    }
                    state.finish_reason = FinishReason::Cancelled;
                }
            }
        }

        state
    }

    /// Fork `session_id` at `up_to_message_id` and start a new turn on the
    /// fork with `prompt`. See spec §4.F "Fork on resume".
    pub async fn resume_from(
        self: &Arc<Self>,
        session_id: &str,
        up_to_message_id: &str,
        prompt: impl Into<String>,
    ) -> Result<oneshot::Receiver<TurnResult>, CoordinatorError> {
        let forked = self.sessions.fork(session_id, up_to_message_id, &self.messages).await?;
        Ok(self.run(forked.id, prompt).await)
    }

    /// Produce a secondary-model summary of `session_id`'s full history,
    /// fork it at the start (copying nothing), attach the summary as the
    /// fork's prefix, and return the new session. Subsequent turns should
    /// run against the returned session, not the original. See spec §4.F
    /// "Summarization".
    pub async fn summarize(self: &Arc<Self>, session_id: &str) -> Result<Session, CoordinatorError> {
        let history = self.messages.list(session_id).await?;
        let Some(first) = history.first() else {
            return Err(CoordinatorError::SessionNotFound(session_id.to_string()));
        };

        let model_history = convert::assemble_model_history(&history, None);
        let summary_text = self.summarize_with_model(model_history).await?;

        let forked = self.sessions.fork(session_id, &first.id, &self.messages).await?;
        let summary_msg = self
            .messages
            .create(
                &forked.id,
                Role::Assistant,
                vec![Part::Text { text: summary_text }],
                Some(self.model.name().to_string()),
                Some(self.model.model_name().to_string()),
            )
            .await?;
        self.messages.finish(&summary_msg.id, FinishReason::EndTurn).await?;

        let mut updated = forked;
        updated.summary_message_id = Some(summary_msg.id);
        self.sessions.update(&updated).await?;
        Ok(updated)
    }

    async fn summarize_with_model(
        &self,
        mut history: Vec<crush_model::Message>,
    ) -> anyhow::Result<String> {
        use futures::StreamExt;

        let before = crush_core::compact_session_with_strategy(
            &mut history,
            None,
            &self.config.agent.compaction_strategy,
        );
        info!(messages_summarized = before, "running secondary summarization turn");

        let req = crush_model::CompletionRequest {
            messages: history,
            tools: vec![],
            stream: true,
            system_dynamic_suffix: None,
        };
        let mut stream = self.model.complete(req).await?;
        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            if let crush_model::ResponseEvent::TextDelta(d) = event? {
                summary.push_str(&d);
            }
        }
        Ok(summary)
    }
}

struct TurnDrainState {
    finish_reason: FinishReason,
    tool_call_count: usize,
    input_tokens: u32,
    output_tokens: u32,
    cache_read_tokens: u32,
    cache_write_tokens: u32,
    cost: f64,
    todos: Option<Vec<crush_store::TodoEntry>>,
}

fn todo_entries_to_items(entries: &[crush_store::TodoEntry]) -> Vec<TodoItem> {
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| TodoItem {
            id: i.to_string(),
            content: e.content.clone(),
            status: match e.status {
                crush_store::TodoStatus::Pending => "pending",
                crush_store::TodoStatus::InProgress => "in_progress",
                crush_store::TodoStatus::Completed => "completed",
            }
            .to_string(),
        })
        .collect()
}

fn todo_items_to_entries(items: &[TodoItem]) -> Vec<crush_store::TodoEntry> {
    items
        .iter()
        .map(|i| crush_store::TodoEntry {
            content: i.content.clone(),
            status: match i.status.as_str() {
                "in_progress" => crush_store::TodoStatus::InProgress,
                "completed" | "cancelled" => crush_store::TodoStatus::Completed,
                _ => crush_store::TodoStatus::Pending,
            },
            active_form: None,
        })
        .collect()
}

fn resolve_db_path(configured: &str) -> PathBuf {
    let path = PathBuf::from(configured);
    if path.is_absolute() {
        return path;
    }
    let base = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join(path)
}
