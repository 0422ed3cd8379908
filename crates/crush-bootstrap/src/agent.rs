// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! [`AgentBuilder`] — single entry point for constructing a fully wired Agent.
//!
//! Callers pass a [`Config`], an optional [`RuntimeContext`], the desired
//! mode and model, and a [`ToolSetProfile`].  The builder handles registry
//! construction and [`AgentRuntimeContext`] population internally.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crush_config::{AgentMode, Config};
use crush_core::{Agent, AgentRuntimeContext};
use crush_model::ModelProvider;
use crush_runtime::{SharedAgents, SharedSkills};
use crush_tools::events::ToolEvent;
use crush_tools::PermissionGate;

use crate::context::{RuntimeContext, ToolSetProfile};
use crate::registry::build_tool_registry;

/// Constructs a fully wired [`Agent`] from configuration and runtime context.
///
/// # Example
/// ```rust,ignore
/// let agent = AgentBuilder::new(config)
///     .with_runtime_context(RuntimeContext::auto_detect())
///     .build(mode, model, ToolSetProfile::Full { ... });
/// ```
pub struct AgentBuilder {
    config: Arc<Config>,
    runtime_ctx: RuntimeContext,
    permission_gate: Option<(String, Arc<dyn PermissionGate>)>,
}

impl AgentBuilder {
    /// Create a builder with the given configuration.
    /// Runtime context defaults to empty (no project/git/CI detection).
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            runtime_ctx: RuntimeContext::empty(),
            permission_gate: None,
        }
    }

    /// Set the runtime context (project root, git, CI environment).
    pub fn with_runtime_context(mut self, ctx: RuntimeContext) -> Self {
        self.runtime_ctx = ctx;
        self
    }

    /// Bind the built agent to a persisted session id and gate every tool
    /// call through `gate`. Used by the coordinator; omitted by sub-agent
    /// builders (e.g. `TaskTool`), which run ungated.
    pub fn with_permission_gate(mut self, session_id: impl Into<String>, gate: Arc<dyn PermissionGate>) -> Self {
        self.permission_gate = Some((session_id.into(), gate));
        self
    }

    /// Build the [`Agent`] with the given mode, model, and tool-set profile.
    ///
    /// This method owns the creation of the shared mode lock and tool-event
    /// channel so that `SwitchModeTool` / `TodoWriteTool` and the agent loop
    /// operate on **the same** instances:
    ///
    /// 1. Creates `mode_lock` (same Arc for both the registry and the Agent).
    /// 2. Creates `(tool_event_tx, tool_event_rx)` (tx → tools, rx → Agent).
    /// 3. Converts [`RuntimeContext`] → [`AgentRuntimeContext`].
    /// 4. Builds a [`ToolRegistry`] via `build_tool_registry`.
    /// 5. Constructs `Agent::new(...)`.
    pub fn build(
        self,
        mode: AgentMode,
        model: Arc<dyn ModelProvider>,
        profile: ToolSetProfile,
    ) -> Agent {
        // Shared mode lock: SwitchModeTool holds a clone; the agent owns it.
        let mode_lock = Arc::new(Mutex::new(mode));
        // Shared event channel: tools send, agent drains.
        let (tool_event_tx, tool_event_rx) = mpsc::channel::<ToolEvent>(64);

        // Discover skills/subagents from the same project root used for
        // git/CI detection, so the system prompt and load_skill/task tools
        // agree on what's available.
        let root = self.runtime_ctx.project_root.as_deref();
        let mut skills = crush_runtime::discover_skills(root);
        skills.extend(crush_runtime::discover_commands(root));
        let agents = crush_runtime::discover_agents(root);

        // Convert RuntimeContext → AgentRuntimeContext (the crush-core type).
        let runtime = AgentRuntimeContext {
            project_root: self.runtime_ctx.project_root,
            git_context_note: self.runtime_ctx.git_context
                .and_then(|g| g.to_prompt_section()),
            ci_context_note: self.runtime_ctx.ci_context
                .and_then(|c| c.to_prompt_section()),
            project_context_file: self.runtime_ctx.project_context_file,
            append_system_prompt: self.runtime_ctx.append_system_prompt,
            system_prompt_override: self.runtime_ctx.system_prompt_override,
            skills: SharedSkills::new(skills),
            agents: SharedAgents::new(agents),
        };

        // Pass runtime.clone() as sub_agent_runtime so TaskTool sub-agents
        // inherit the parent's project root, AGENTS.md, CI/git context.
        let registry = build_tool_registry(
            &self.config,
            model.clone(),
            profile,
            mode_lock.clone(),
            tool_event_tx,
            runtime.clone(),
        );

        // Resolve context window from the static catalog; fall back to 128 000.
        let context_window = model.catalog_context_window().unwrap_or(128_000) as usize;

        // Sync the tool-concurrency cap from the tools config; the agent only
        // carries its own AgentConfig, not the full Config.
        let mut agent_config = self.config.agent.clone();
        agent_config.tool_concurrency = self.config.tools.concurrency;

        let agent = Agent::new(
            model,
            Arc::new(registry),
            Arc::new(agent_config),
            runtime,
            mode_lock,
            tool_event_rx,
            context_window,
        );

        match self.permission_gate {
            Some((session_id, gate)) => agent.with_permission_gate(session_id, gate),
            None => agent,
        }
    }
}
