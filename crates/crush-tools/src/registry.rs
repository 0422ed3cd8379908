// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::{PermissionGate, Tool, ToolCall, ToolKind, ToolOutput};

/// A tool schema – mirrors crush_model::ToolSchema but keeps tools crate
/// independent from the model crate.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Default cap on tool calls executed concurrently within a single turn.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Central registry holding all available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

// SAFETY: ToolRegistry is Sync because:
// - HashMap<String, Arc<dyn Tool>> is Sync (String is Sync, Arc<T: Send + Sync> is Sync)
// - Tools implement Send + Sync (required by the Tool trait)
// - No interior mutability exists after construction (all methods take &self)
// - Parallel tool execution is safe because tools are immutable after registration
unsafe impl Sync for ToolRegistry {}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Produce schemas for every registered tool, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self.tools.values().map(|t| ToolSchema {
            name: t.name().to_string(),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        }).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// The [`ToolKind`] of a registered tool, used by the permission arbiter
    /// to decide whether a call needs a grant. `None` if the tool is unknown.
    pub fn kind_of(&self, name: &str) -> Option<ToolKind> {
        self.tools.get(name).map(|t| t.kind())
    }

    pub async fn execute(&self, call: &ToolCall) -> ToolOutput {
        match self.tools.get(&call.name) {
            Some(tool) => tool.execute(call).await,
            None => ToolOutput::err(
                &call.id,
                format!("unknown tool: {}", call.name),
            ),
        }
    }

    /// Execute a tool call subject to a permission gate. `gate` is consulted
    /// with the call's [`ToolKind`] before dispatch; an unknown tool never
    /// reaches the gate (it fails the same way [`Self::execute`] does).
    /// Pass `None` to fall back to unconditional dispatch, matching
    /// sub-agent registries that don't carry a gate of their own.
    pub async fn execute_gated(
        &self,
        session_id: &str,
        call: &ToolCall,
        gate: Option<&(dyn PermissionGate)>,
    ) -> ToolOutput {
        let tool = match self.tools.get(&call.name) {
            Some(tool) => tool,
            None => return ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
        };
        if let Some(gate) = gate {
            if !gate.check(session_id, call, tool.kind()).await {
                return ToolOutput::err(&call.id, "denied: permission not granted");
            }
        }
        tool.execute(call).await
    }

    /// Execute many tool calls concurrently, bounded by `concurrency`
    /// (the permit count; pass [`DEFAULT_CONCURRENCY`] when the caller has
    /// no stronger opinion). Results are returned in the same order as `calls`.
    pub async fn execute_many(&self, calls: &[ToolCall], concurrency: usize) -> Vec<ToolOutput> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut handles = Vec::with_capacity(calls.len());
        for call in calls {
            let call = call.clone();
            let tool = self.tools.get(&call.name).cloned();
            let sem = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore not closed");
                match tool {
                    Some(tool) => tool.execute(&call).await,
                    None => ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
                }
            }));
        }
        let mut outputs = Vec::with_capacity(handles.len());
        for handle in handles {
            outputs.push(handle.await.expect("tool task panicked"));
        }
        outputs
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self { Self::new() }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
