// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Slash-command parsing and the `AvailableCommands` list. See spec §4.G.
//!
//! A slash command either expands to a canned model prompt (`init`) or to a
//! purely local state change (`yolo`). Either way the adapter, not the
//! client, decides what happens — the client only ever sees the resulting
//! `sessionUpdate`s.

/// One entry of the adapter's `AvailableCommands` list.
#[derive(Debug, Clone)]
pub struct SlashCommand {
    pub name: &'static str,
    pub description: &'static str,
}

pub const BUILTIN_COMMANDS: &[SlashCommand] = &[
    SlashCommand { name: "yolo", description: "Toggle auto-approval of all tool calls for this session" },
    SlashCommand { name: "init", description: "Generate or refresh the project context file" },
    SlashCommand { name: "summarize", description: "Summarize the conversation so far and continue in a fresh context" },
    SlashCommand { name: "session", description: "Switch the active session (fork or resume)" },
    SlashCommand { name: "model", description: "Switch the active model" },
    SlashCommand { name: "think", description: "Toggle visibility of the model's reasoning" },
    SlashCommand { name: "help", description: "List available commands" },
];

/// A parsed local command and its raw argument string (everything after the
/// command name, trimmed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalCommand {
    Yolo,
    Init,
    Summarize,
    Session(String),
    Model(String),
    Think,
    Help,
    /// A command name with no matching built-in. Forwarded to the model
    /// verbatim (project/user-defined commands resolve to a canned prompt
    /// the caller looks up by name).
    Unknown(String, String),
}

/// Parse a user prompt's leading text block into a local command, or `None`
/// if it is not a slash command at all (i.e. an ordinary prompt to forward
/// to the model unchanged).
pub fn parse(first_text_block: &str) -> Option<LocalCommand> {
    let text = first_text_block.trim_start();
    let rest = text.strip_prefix('/')?;
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim().to_string()),
        None => (rest.trim_end(), String::new()),
    };
    Some(match name {
        "yolo" => LocalCommand::Yolo,
        "init" => LocalCommand::Init,
        "summarize" => LocalCommand::Summarize,
        "session" => LocalCommand::Session(arg),
        "model" => LocalCommand::Model(arg),
        "think" => LocalCommand::Think,
        "help" => LocalCommand::Help,
        other => LocalCommand::Unknown(other.to_string(), arg),
    })
}

/// The canned prompt `init` expands to before it reaches the model.
pub const INIT_PROMPT: &str = "Inspect this project and write or refresh its context file \
(AGENTS.md or CLAUDE.md) summarizing architecture, conventions, and commands a new contributor \
or agent session would need.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_builtins() {
        assert_eq!(parse("/yolo"), Some(LocalCommand::Yolo));
        assert_eq!(parse("/help"), Some(LocalCommand::Help));
        assert_eq!(parse("/model gpt-4"), Some(LocalCommand::Model("gpt-4".into())));
    }

    #[test]
    fn non_slash_text_is_not_a_command() {
        assert_eq!(parse("hello there"), None);
    }

    #[test]
    fn unknown_slash_name_falls_through_as_unknown() {
        assert_eq!(parse("/deploy staging"), Some(LocalCommand::Unknown("deploy".into(), "staging".into())));
    }

    #[test]
    fn leading_whitespace_before_slash_still_parses() {
        assert_eq!(parse("  /think"), Some(LocalCommand::Think));
    }
}
