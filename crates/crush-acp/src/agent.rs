// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`CrushAgent`]: the `agent_client_protocol::Agent` implementation that
//! exposes a [`crush_coordinator::Coordinator`] over ACP. See spec §4.G.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use agent_client_protocol::{
    Agent, AgentCapabilities, AuthenticateRequest, AuthenticateResponse, AvailableCommand,
    AvailableCommandsUpdate, CancelNotification, Client, ContentBlock, Error, InitializeRequest,
    InitializeResponse, NewSessionRequest, NewSessionResponse, Plan, PlanEntry, PlanEntryPriority,
    PlanEntryStatus, PromptCapabilities, PromptRequest, PromptResponse, ProtocolVersion, SessionId,
    SessionNotification, SessionUpdate, StopReason,
};
use async_trait::async_trait;
use tracing::{info, warn};

use crush_coordinator::{Coordinator, CoordinatorEvent};
use crush_store::FinishReason;
use crush_tools::events::TodoItem;

use crate::commands::{self, LocalCommand, BUILTIN_COMMANDS, INIT_PROMPT};
use crate::delta::DeltaTranslator;
use crate::permission;

/// Flattens a client-submitted prompt's content blocks into the single
/// string `Coordinator::run` expects. Non-text blocks are rendered as a
/// bracketed placeholder so the model still sees that *something* was
/// attached, even though crush's v1 model loop is text-only (spec §4.G:
/// prompt capabilities declare image/audio unsupported).
fn flatten_prompt(blocks: &[ContentBlock]) -> String {
    let mut out = String::new();
    for block in blocks {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        match block {
            ContentBlock::Text(text) => out.push_str(&text.text),
            ContentBlock::ResourceLink(link) => {
                out.push_str(&format!("[resource: {}]", link.uri));
            }
            ContentBlock::Resource(resource) => {
                out.push_str(&format!("[embedded resource: {:?}]", resource.resource));
            }
            ContentBlock::Image(_) => out.push_str("[image attachment omitted]"),
            ContentBlock::Audio(_) => out.push_str("[audio attachment omitted]"),
        }
    }
    out
}

/// The ACP-facing agent. Holds no conversation state itself — every request
/// is a thin call into `coordinator`, and the client handle is used only to
/// push notifications the coordinator's event streams produce.
pub struct CrushAgent {
    coordinator: Arc<Coordinator>,
    client: Arc<dyn Client>,
    /// Sessions with a synthesized user message pending echo. Shared with
    /// every `DeltaTranslator` this agent spawns; see spec §4.G.
    echo_user: Arc<Mutex<HashSet<String>>>,
}

impl CrushAgent {
    /// `client` is the handle the hosting connection (`AgentSideConnection`
    /// or equivalent) hands back once the transport is wired up.
    pub fn new(coordinator: Arc<Coordinator>, client: Arc<dyn Client>) -> Self {
        permission::spawn(coordinator.arbiter().clone(), client.clone());
        Self { coordinator, client, echo_user: Arc::new(Mutex::new(HashSet::new())) }
    }

    fn spawn_stream(&self, session_id: String) {
        let translator = DeltaTranslator::new(session_id.clone(), self.echo_user.clone());
        let messages = self.coordinator.messages().subscribe();
        let client = self.client.clone();
        tokio::spawn(translator.run(messages, client));

        self.spawn_plan_updates(session_id);
    }

    /// Forward the coordinator's todo-list updates as ACP `plan` session
    /// updates (spec §6). Runs for the lifetime of the session, same as
    /// `spawn_stream`'s message translator.
    fn spawn_plan_updates(&self, session_id: String) {
        let mut events = self.coordinator.subscribe_events();
        let client = self.client.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let CoordinatorEvent::TodoUpdated { session_id: sid, todos } = event.payload else {
                    continue;
                };
                if sid != session_id {
                    continue;
                }
                let entries = todos.iter().map(todo_to_plan_entry).collect();
                let update = SessionUpdate::Plan(Plan::new(entries));
                let notification = SessionNotification::new(SessionId::from(session_id.as_str()), update);
                if let Err(e) = client.session_notification(notification).await {
                    warn!(error = %e, session_id, "plan update delivery failed, continuing");
                }
            }
        });
    }

    async fn push_available_commands(&self, session_id: &str) {
        let project_root = crush_runtime::find_project_root().ok();
        let mut commands: Vec<AvailableCommand> = BUILTIN_COMMANDS
            .iter()
            .map(|c| AvailableCommand::new(c.name, c.description))
            .collect();
        for skill in crush_runtime::discover_commands(project_root.as_deref()) {
            commands.push(AvailableCommand::new(skill.command, skill.description));
        }
        let update = SessionUpdate::AvailableCommandsUpdate(AvailableCommandsUpdate::new(commands));
        let notification = SessionNotification::new(SessionId::from(session_id), update);
        if let Err(e) = self.client.session_notification(notification).await {
            warn!(error = %e, session_id, "availableCommands push failed");
        }
    }

    /// Run a slash command locally without involving the model. Returns the
    /// stop reason to report back to the client.
    async fn run_local_command(&self, session_id: &str, cmd: LocalCommand) -> Result<StopReason, Error> {
        match cmd {
            LocalCommand::Yolo => {
                let arbiter = self.coordinator.arbiter();
                let now = !arbiter.skip_requests();
                arbiter.set_skip_requests(now);
                self.announce(session_id, &format!("yolo mode is now {}", if now { "on" } else { "off" })).await;
                Ok(StopReason::EndTurn)
            }
            LocalCommand::Help => {
                let list = BUILTIN_COMMANDS
                    .iter()
                    .map(|c| format!("/{} - {}", c.name, c.description))
                    .collect::<Vec<_>>()
                    .join("\n");
                self.announce(session_id, &list).await;
                Ok(StopReason::EndTurn)
            }
            LocalCommand::Think => {
                self.announce(session_id, "reasoning visibility is controlled by the client's display, not adapter state").await;
                Ok(StopReason::EndTurn)
            }
            LocalCommand::Session(_) | LocalCommand::Model(_) => {
                self.announce(session_id, "switching sessions or models from within a turn is not yet supported over ACP; use a fresh newSession/prompt instead").await;
                Ok(StopReason::EndTurn)
            }
            LocalCommand::Init => self.run_synthesized_prompt(session_id, INIT_PROMPT).await,
            LocalCommand::Summarize => {
                self.coordinator.summarize(session_id).await.map_err(|e| Error::new(-32000, e.to_string()))?;
                self.announce(session_id, "conversation summarized").await;
                Ok(StopReason::EndTurn)
            }
            LocalCommand::Unknown(name, arg) => {
                // Not a built-in: forward to the model as a synthesized prompt
                // so project/user-defined commands (resolved by name elsewhere)
                // still produce a response rather than silently no-op-ing. The
                // client only saw the literal "/name ..." text, not what this
                // expands to, so echo it back once it resolves.
                let prompt = if arg.is_empty() { format!("/{name}") } else { format!("/{name} {arg}") };
                self.run_synthesized_prompt(session_id, &prompt).await
            }
        }
    }

    /// Ordinary client-submitted prompt: the client already rendered what it
    /// sent, so the resulting user message is not echoed back.
    async fn run_model_prompt(&self, session_id: &str, prompt: &str) -> Result<StopReason, Error> {
        let rx = self.coordinator.run(session_id, prompt).await;
        self.await_turn(rx).await
    }

    /// Adapter-synthesized prompt (e.g. a slash command's canned text): the
    /// client never saw this text, so arm a one-shot echo of the resulting
    /// user message before running the turn.
    async fn run_synthesized_prompt(&self, session_id: &str, prompt: &str) -> Result<StopReason, Error> {
        self.echo_user.lock().expect("echo_user lock poisoned").insert(session_id.to_string());
        let rx = self.coordinator.run(session_id, prompt).await;
        self.await_turn(rx).await
    }

    async fn await_turn(
        &self,
        rx: tokio::sync::oneshot::Receiver<Result<crush_coordinator::TurnOutcome, crush_coordinator::CoordinatorError>>,
    ) -> Result<StopReason, Error> {
        match rx.await {
            Ok(Ok(outcome)) => Ok(stop_reason_for(outcome.finish_reason)),
            Ok(Err(e)) => Err(Error::new(-32000, e.to_string())),
            Err(_) => Err(Error::new(-32000, "turn responder dropped without a result")),
        }
    }

    async fn announce(&self, session_id: &str, text: &str) {
        let block = ContentBlock::Text(agent_client_protocol::TextContent::new(text.to_string()));
        let update = SessionUpdate::AgentMessageChunk(agent_client_protocol::AgentMessageChunk::new(block));
        let notification = SessionNotification::new(SessionId::from(session_id), update);
        if let Err(e) = self.client.session_notification(notification).await {
            warn!(error = %e, session_id, "announcement delivery failed");
        }
    }
}

/// `TodoItem` carries no priority, so every entry reports `Medium`; ACP's
/// plan entries require one. `"cancelled"` has no ACP equivalent and is
/// reported as `Completed` — the entry is done being tracked either way.
fn todo_to_plan_entry(item: &TodoItem) -> PlanEntry {
    let status = match item.status.as_str() {
        "pending" => PlanEntryStatus::Pending,
        "in_progress" => PlanEntryStatus::InProgress,
        "completed" | "cancelled" => PlanEntryStatus::Completed,
        _ => PlanEntryStatus::Pending,
    };
    PlanEntry::new(item.content.clone(), PlanEntryPriority::Medium, status)
}

fn stop_reason_for(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::EndTurn | FinishReason::ToolCalls => StopReason::EndTurn,
        FinishReason::MaxTokens => StopReason::MaxTokens,
        FinishReason::Cancelled => StopReason::Cancelled,
        FinishReason::Error => StopReason::Refusal,
    }
}

#[async_trait(?Send)]
impl Agent for CrushAgent {
    async fn initialize(&self, _req: InitializeRequest) -> Result<InitializeResponse, Error> {
        Ok(InitializeResponse::new(ProtocolVersion::LATEST).agent_capabilities(
            AgentCapabilities::new()
                .prompt_capabilities(PromptCapabilities::new().embedded_context(true)),
        ))
    }

    async fn authenticate(&self, _req: AuthenticateRequest) -> Result<AuthenticateResponse, Error> {
        Ok(AuthenticateResponse::new())
    }

    async fn new_session(&self, req: NewSessionRequest) -> Result<NewSessionResponse, Error> {
        let title = req
            .cwd
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "session".to_string());
        let session = self
            .coordinator
            .sessions()
            .create(title)
            .await
            .map_err(|e| Error::new(-32000, e.to_string()))?;
        info!(session_id = %session.id, "ACP session created");

        self.spawn_stream(session.id.clone());
        self.push_available_commands(&session.id).await;

        Ok(NewSessionResponse::new(session.id))
    }

    async fn prompt(&self, req: PromptRequest) -> Result<PromptResponse, Error> {
        let session_id = req.session_id.to_string();
        let first_text = req.prompt.iter().find_map(|b| match b {
            ContentBlock::Text(t) => Some(t.text.as_str()),
            _ => None,
        });

        let stop_reason = match first_text.and_then(commands::parse) {
            Some(cmd) => self.run_local_command(&session_id, cmd).await?,
            None => {
                let prompt = flatten_prompt(&req.prompt);
                self.run_model_prompt(&session_id, &prompt).await?
            }
        };

        Ok(PromptResponse::new(stop_reason))
    }

    async fn cancel(&self, notif: CancelNotification) -> Result<(), Error> {
        let session_id = notif.session_id.to_string();
        self.coordinator.cancel(&session_id).await;
        Ok(())
    }
}
