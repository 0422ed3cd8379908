// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Command-line surface. Two run modes share one process:
//!
//! - ACP server (`--acp`, or no prompt given on a tty stdin): speaks the
//!   Agent Client Protocol over stdio so an ACP-aware editor can drive crush
//!   as its agent backend.
//! - Headless single turn (a `prompt` argument, or one piped on stdin): runs
//!   exactly one turn against the coordinator and prints the result in the
//!   format selected by `--format`, then exits (spec §6).

use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use crush_config::AgentMode;

/// Non-interactive output format for a headless turn. See spec §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Plain stdout, streamed as the assistant message grows.
    Text,
    /// One structured JSON object printed after the turn finishes.
    Json,
    /// Newline-delimited JSON, one line per coordinator/agent event.
    StreamJson,
    /// The model's final text only, nothing else on stdout.
    Raw,
}

#[derive(Debug, Parser)]
#[command(name = "crush", version, about = "An interactive coding agent with an Agent Client Protocol front end")]
pub struct Cli {
    /// Prompt text for a headless turn. Omit to read from stdin (when piped)
    /// or to start an ACP server (when stdin is a tty and `--acp` is given).
    pub prompt: Option<String>,

    /// Speak the Agent Client Protocol over stdio instead of running one
    /// headless turn.
    #[arg(long)]
    pub acp: bool,

    /// Output format for a headless turn.
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Explicit config file, merged on top of the layered user/project config.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the configured model, as `provider/model` or a bare model name.
    #[arg(long, value_name = "PROVIDER/MODEL")]
    pub model: Option<String>,

    /// Agent operating mode for the turn.
    #[arg(long, value_enum, default_value_t = AgentMode::Agent)]
    pub mode: AgentMode,

    /// Resume an existing session instead of creating a new one.
    #[arg(long, value_name = "SESSION_ID")]
    pub session: Option<String>,

    /// Fork `--session` at this message id before running the prompt
    /// (spec §4.F "Fork on resume"); requires `--session`.
    #[arg(long, value_name = "MESSAGE_ID", requires = "session")]
    pub fork_at: Option<String>,

    /// Auto-approve every permission request for this run (the `/yolo`
    /// toggle, set for the whole process instead of per-session).
    #[arg(long)]
    pub yolo: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace). Overridden by
    /// `RUST_LOG` if set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// True when this invocation should run the ACP server rather than a
    /// single headless turn: either requested explicitly, or no prompt was
    /// given and there is no piped stdin to read one from.
    pub fn wants_acp_server(&self) -> bool {
        self.acp || (self.prompt.is_none() && is_stdin_tty())
    }
}

fn is_stdin_tty() -> bool {
    use std::io::IsTerminal;
    std::io::stdin().is_terminal()
}
