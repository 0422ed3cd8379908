// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Named provider configurations.
    ///
    /// Define custom endpoints, local models, or additional accounts here and
    /// reference them by name with `--model <key>` or `--model <key>/<model>`.
    ///
    /// ```yaml
    /// providers:
    ///   my_ollama:
    ///     provider: openai        # uses the OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2          # default model for this provider
    ///   work_anthropic:
    ///     provider: anthropic
    ///     api_key_env: WORK_ANTHROPIC_KEY
    ///     name: claude-opus-4-5
    /// ```
    #[serde(default)]
    pub providers: std::collections::HashMap<String, ModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier forwarded to the pluggable `ModelProvider`
    /// implementation loaded by the embedding application. Concrete transport
    /// wiring (HTTP clients, auth, retries) lives outside this crate; crush
    /// only carries the configuration shape.
    pub provider: String,
    /// Model name forwarded to the provider
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies or self-hosted gateways.
    pub base_url: Option<String>,
    /// Maximum tokens to request in a single completion
    pub max_tokens: Option<u32>,
    /// Sampling temperature (0.0–2.0)
    pub temperature: Option<f32>,

    // ── Prompt caching ────────────────────────────────────────────────────────
    /// Attach an explicit cache-control marker to the system message, for
    /// providers whose wire format supports prefix caching.
    #[serde(default = "default_true")]
    pub cache_system_prompt: bool,
    /// Use an extended cache TTL instead of the provider default, when
    /// supported.
    #[serde(default)]
    pub extended_cache_time: bool,
    /// Cache tool definitions, when supported.
    #[serde(default = "default_true")]
    pub cache_tools: bool,
    /// Cache conversation history, when supported.
    #[serde(default = "default_true")]
    pub cache_conversation: bool,

    // ── Provider-specific extras ──────────────────────────────────────────────
    /// Free-form provider-specific options forwarded as-is to the driver.
    #[serde(default)]
    pub driver_options: serde_json::Value,

    // ── Mock provider (used by the bundled test double and by CRUSH_MOCK_RESPONSES) ──
    /// Path to YAML mock-responses file (used when provider = "mock").
    /// Can also be set via the CRUSH_MOCK_RESPONSES environment variable.
    pub mock_responses_file: Option<String>,

    // ── Estimated cost ────────────────────────────────────────────────────────
    /// USD per 1,000 input tokens, used only to compute the session's
    /// estimated-cost counter. `None` (the default, and always for the mock
    /// provider) means every turn against this model costs 0.0.
    pub cost_per_1k_input_tokens: Option<f64>,
    /// USD per 1,000 output tokens.
    pub cost_per_1k_output_tokens: Option<f64>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "mock".into(),
            name: "mock-1".into(),
            api_key_env: None,
            api_key: None,
            base_url: None,
            max_tokens: Some(4096),
            temperature: Some(0.2),
            cache_system_prompt: true,
            extended_cache_time: false,
            cache_tools: true,
            cache_conversation: true,
            driver_options: serde_json::Value::Null,
            mock_responses_file: None,
            cost_per_1k_input_tokens: None,
            cost_per_1k_output_tokens: None,
        }
    }
}

fn default_max_tool_rounds() -> u32 {
    200
}
fn default_compaction_threshold() -> f32 {
    0.85
}

/// Strategy used when compacting the session context.
///
/// `Structured` (default) instructs the model to produce a typed Markdown
/// checkpoint with fixed sections (Active Task, Key Decisions, Files &
/// Artifacts, Constraints, Pending Items, Session Narrative).  This produces
/// checkpoints that are easier for the model to navigate on future turns.
///
/// `Narrative` uses a free-form summarisation prompt instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompactionStrategy {
    #[default]
    Structured,
    Narrative,
}

impl std::fmt::Display for CompactionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactionStrategy::Structured => write!(f, "structured"),
            CompactionStrategy::Narrative => write!(f, "narrative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum number of autonomous tool-call rounds before stopping
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Token fraction at which proactive compaction triggers (0.0–1.0).
    /// The budget gate compares effective tokens (calibrated estimate + schema
    /// overhead) against the model's usable input budget, which is
    /// context_window minus max_output_tokens.
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,
    /// Number of recent non-system messages preserved verbatim during
    /// compaction.  The oldest messages beyond this tail are summarised by
    /// the LLM.  Higher values retain more recent context but reduce the
    /// compression benefit.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
    /// Compaction checkpoint format.
    #[serde(default)]
    pub compaction_strategy: CompactionStrategy,
    /// Maximum tokens allowed for a single tool result before it is
    /// deterministically truncated before entering the session.
    ///
    /// Truncation is content-aware: shell output keeps head+tail lines, grep
    /// keeps leading matches, read_file keeps head+tail lines.  A value of
    /// 0 disables per-result truncation entirely.
    #[serde(default = "default_tool_result_token_cap")]
    pub tool_result_token_cap: usize,
    /// Fraction of the context window reserved for tool schemas and
    /// measurement error in the token approximation.  Reduces the effective
    /// compaction trigger threshold.
    #[serde(default = "default_compaction_overhead_reserve")]
    pub compaction_overhead_reserve: f32,
    /// System prompt override; leave None to use the built-in prompt
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Per-turn wall-clock timeout in seconds (0 = no limit).
    #[serde(default)]
    pub max_turn_timeout_secs: u64,
    /// Maximum number of sessions that may be compacting concurrently
    /// across the process (a coarse resource-budget knob, see
    /// `crush_core::Coordinator`).
    #[serde(default = "default_max_concurrent_compactions")]
    pub max_concurrent_compactions: usize,
    /// Maximum number of tool calls the agent executes concurrently within
    /// one round. Synced from `ToolsConfig::concurrency` when the config is
    /// loaded; defaults to the same value.
    #[serde(default = "default_tool_concurrency")]
    pub tool_concurrency: usize,
}

fn default_compaction_keep_recent() -> usize {
    6
}
fn default_tool_result_token_cap() -> usize {
    4000
}
fn default_compaction_overhead_reserve() -> f32 {
    0.10
}
fn default_max_concurrent_compactions() -> usize {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_tool_rounds: 200,
            compaction_threshold: 0.85,
            compaction_keep_recent: default_compaction_keep_recent(),
            compaction_strategy: CompactionStrategy::Structured,
            tool_result_token_cap: default_tool_result_token_cap(),
            compaction_overhead_reserve: default_compaction_overhead_reserve(),
            system_prompt: None,
            max_turn_timeout_secs: 0,
            max_concurrent_compactions: default_max_concurrent_compactions(),
            tool_concurrency: default_tool_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Automatically approve shell commands matching these glob patterns,
    /// independent of the permission arbiter's session grants.
    pub auto_approve_patterns: Vec<String>,
    /// Block shell commands matching these glob patterns outright.
    pub deny_patterns: Vec<String>,
    /// Timeout in seconds for a single tool call
    pub timeout_secs: u64,
    /// Maximum number of tool calls executed concurrently within one turn.
    #[serde(default = "default_tool_concurrency")]
    pub concurrency: usize,
    /// Web fetch and search configuration
    #[serde(default)]
    pub web: WebConfig,
    /// Persistent project-memory file configuration
    #[serde(default)]
    pub memory: MemoryConfig,
}

fn default_tool_concurrency() -> usize {
    crush_tools_default_concurrency()
}

// Kept as a free function (rather than importing crush-tools, which would be
// a cyclic dependency) — mirrors `crush_tools::registry::DEFAULT_CONCURRENCY`.
fn crush_tools_default_concurrency() -> usize {
    4
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            auto_approve_patterns: vec![
                "cat *".into(),
                "ls *".into(),
                "find *".into(),
                "rg *".into(),
                "grep *".into(),
            ],
            deny_patterns: vec!["rm -rf /*".into(), "dd if=*".into()],
            timeout_secs: 30,
            concurrency: default_tool_concurrency(),
            web: WebConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

/// Location of the persistent, agent-editable project-memory file
/// (`update_memory` tool).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Path to the memory file, relative to the project root unless absolute.
    #[serde(default = "default_memory_file")]
    pub memory_file: String,
}

fn default_memory_file() -> String {
    "CRUSH.md".into()
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            memory_file: default_memory_file(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebSearchConfig {
    /// Search API key (also checked via a provider-specific env var by the
    /// embedding application).
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Search backend configuration
    #[serde(default)]
    pub search: WebSearchConfig,
    /// Default maximum characters for web_fetch (default 50000)
    pub fetch_max_chars: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            search: WebSearchConfig::default(),
            fetch_max_chars: 50_000,
        }
    }
}

/// Global escape hatches for the permission arbiter (`crush-permission`).
///
/// These are evaluated *before* any per-session grant: `yolo_mode` skips the
/// arbiter for every request; `allowed_tools` and `skip_request_patterns`
/// scope that bypass to specific tools or specific request shapes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// Skip the permission arbiter entirely for every request in every
    /// session. Equivalent to the arbiter never being consulted.
    #[serde(default)]
    pub yolo_mode: bool,
    /// Tool names that never require a grant, regardless of session state.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Session ids that should be treated as pre-approved for the lifetime
    /// of the process (used by headless/CI invocations that cannot render a
    /// permission prompt).
    #[serde(default)]
    pub auto_approve_sessions: Vec<String>,
    /// Wall-clock seconds to wait for a permission response before treating
    /// it as denied.
    #[serde(default = "default_permission_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_permission_timeout_secs() -> u64 {
    120
}

/// Embedded SQLite session/message store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database file. Relative paths are resolved against
    /// `XDG_DATA_HOME` (or `~/.local/share`) by the loader's caller.
    #[serde(default = "default_store_db_path")]
    pub db_path: String,
}

fn default_store_db_path() -> String {
    "crush/store.sqlite3".into()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { db_path: default_store_db_path() }
    }
}

/// Per-subscriber broker buffering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Bounded buffer capacity per subscriber before the oldest unread event
    /// is dropped (and a drop counter incremented).
    #[serde(default = "default_broker_buffer_size")]
    pub subscriber_buffer_size: usize,
}

fn default_broker_buffer_size() -> usize {
    256
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { subscriber_buffer_size: default_broker_buffer_size() }
    }
}

/// The operating mode an agent turn runs under.
///
/// Chosen per-session (and switchable mid-session via the `switch_mode`
/// tool or the ACP `session/set_mode` request); selects the system prompt
/// variant and, for `Plan`, whether file-editing tools are withheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    /// Read-only investigation: answer questions, no edits, no shell.
    Research,
    /// Produce a plan before any edits are made.
    Plan,
    /// Full read/write/execute agent loop. Default mode.
    #[default]
    Agent,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AgentMode::Research => "research",
            AgentMode::Plan => "plan",
            AgentMode::Agent => "agent",
        })
    }
}

impl std::str::FromStr for AgentMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "research" => Ok(AgentMode::Research),
            "plan" => Ok(AgentMode::Plan),
            "agent" => Ok(AgentMode::Agent),
            other => Err(format!("unknown agent mode: {other}")),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
