// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use async_trait::async_trait;
use serde_json::Value;

use crate::policy::ApprovalPolicy;

/// Coarse classification of what a tool *does*, independent of its name.
///
/// The permission arbiter and the approval-policy layer key off this instead
/// of matching on tool names, so a new tool automatically inherits sane
/// default gating just by picking the right variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolKind {
    /// Reads data without side effects (file reads, directory listings).
    Read,
    /// Mutates the workspace (write, edit, delete, patch).
    Edit,
    /// Runs an external process (shell, terminal commands).
    Execute,
    /// Looks things up without mutating anything (grep, glob, codebase search).
    Search,
    /// Reaches outside the local workspace (web fetch/search).
    Fetch,
    /// Anything that does not fit the above (todo list bookkeeping, etc).
    #[default]
    Other,
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments
    pub args: Value,
}

/// A single content item in a rich tool output.
///
/// Most tools produce only `Text`.  Vision-capable tools (e.g. `read_image`)
/// may produce a mix of `Text` and `Image` items.
#[derive(Debug, Clone)]
pub enum ToolOutputPart {
    /// Plain UTF-8 text.
    Text(String),
    /// Base64 data URL: `data:<mime>;base64,<b64>`.
    Image(String),
}

/// The result of executing a tool.
///
/// ## Backward compatibility
/// `content` is always the plain-text representation of the output (the
/// concatenation of all `Text` parts).  Existing tools and tests that only
/// access `content` continue to work unchanged.
///
/// ## Image support
/// Tools that return images populate `parts` with a mix of [`ToolOutputPart::Text`]
/// and [`ToolOutputPart::Image`] items.  The agent maps these into the
/// appropriate [`crush_model::ToolResultContent`] variant when building the
/// conversation history.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub call_id: String,
    /// Plain-text content — concatenation of all Text parts.
    /// Always set; always readable.  Backward-compatible field.
    pub content: String,
    /// Structured parts (text and/or images).  For tools that only return
    /// text this contains exactly one `Text` part mirroring `content`.
    pub parts: Vec<ToolOutputPart>,
    /// If true, the tool execution failed non-fatally (returned error message).
    pub is_error: bool,
    /// Structured side-channel data describing what the tool did, beyond the
    /// plain-text `content`.  Edit-class tools (`edit_file`, `apply_patch`,
    /// `write`) populate this with `{file_path, old_content, new_content}` so
    /// the ACP adapter can render a diff instead of a text blob.  `None` for
    /// tools with nothing structured to report.
    pub metadata: Option<Value>,
}

impl ToolOutput {
    /// Successful plain-text result.
    pub fn ok(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let text = content.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: false,
            metadata: None,
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(call_id: impl Into<String>, msg: impl Into<String>) -> Self {
        let text = msg.into();
        let call_id = call_id.into();
        Self {
            call_id,
            content: text.clone(),
            parts: vec![ToolOutputPart::Text(text)],
            is_error: true,
            metadata: None,
        }
    }

    /// Result with arbitrary parts (text and/or images).
    ///
    /// `content` is set to the concatenation of all Text parts.
    pub fn with_parts(call_id: impl Into<String>, parts: Vec<ToolOutputPart>) -> Self {
        let text = parts
            .iter()
            .filter_map(|p| match p {
                ToolOutputPart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            call_id: call_id.into(),
            content: text,
            parts,
            is_error: false,
            metadata: None,
        }
    }

    /// Attach structured metadata to this result.  Builder-style; call after
    /// [`ToolOutput::ok`]/[`ToolOutput::with_parts`].
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Return `true` if this output contains at least one image part.
    pub fn has_images(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, ToolOutputPart::Image(_)))
    }
}

/// Describes the shape of a tool's text output for context-aware truncation.
///
/// When a tool result exceeds the configured token cap, `crush-core` uses
/// this category to pick the right extraction strategy.  Each tool declares
/// its own category; `crush-core` never hard-codes tool names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputCategory {
    /// Terminal / process output: keep the first 60 + last 40 lines so both
    /// the command preamble and the final result are visible.
    /// Suitable for: shell, run_terminal_command.
    HeadTail,
    /// Ordered match list: keep the leading matches so the model sees the
    /// highest-relevance results first.
    /// Suitable for: grep, search_codebase, read_lints.
    MatchList,
    /// File content: keep a head and tail window with a separator so the
    /// model sees both the top of the file (imports, declarations) and the
    /// end (recent changes).
    /// Suitable for: read_file, fs read operations.
    FileContent,
    /// Generic text: hard-truncate at the character boundary.
    /// Used for all tools that do not fit the categories above.
    #[default]
    Generic,
}

/// Best-effort extraction of the resource a call acts on, for permission
/// prompts and audit logging. Built-in tools key their primary argument as
/// either `path` (file-system tools) or `command` (execute-class tools); this
/// reads straight off the call arguments rather than asking every tool to
/// implement an extractor.
pub fn permission_path(call: &ToolCall) -> Option<String> {
    call.args
        .get("path")
        .or_else(|| call.args.get("command"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Trait that every built-in and user-defined tool must implement.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    /// Default approval level for this tool
    fn default_policy(&self) -> ApprovalPolicy;
    /// Coarse classification used by the permission arbiter to decide what
    /// kind of grant (if any) a call to this tool should require.
    /// Default: [`ToolKind::Other`].
    fn kind(&self) -> ToolKind {
        ToolKind::Other
    }
    /// Describes the shape of this tool's output for context-aware truncation.
    ///
    /// Override this when your tool produces output whose leading or trailing
    /// portion is more useful than a hard cut.  The default is
    /// [`OutputCategory::Generic`] (hard truncation).
    fn output_category(&self) -> OutputCategory {
        OutputCategory::Generic
    }
    /// Agent modes this tool is registered under.  Default: all modes.
    ///
    /// Overridden by tools whose effects don't make sense in a given mode
    /// (e.g. `task` is withheld outside [`crush_config::AgentMode::Agent`]
    /// to avoid a read-only research turn spawning a writing sub-agent).
    fn modes(&self) -> &[crush_config::AgentMode] {
        use crush_config::AgentMode;
        &[AgentMode::Research, AgentMode::Plan, AgentMode::Agent]
    }
    /// Execute the tool.  Errors should be wrapped in [`ToolOutput::err`].
    async fn execute(&self, call: &ToolCall) -> ToolOutput;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
