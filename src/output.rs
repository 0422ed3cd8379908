// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Headless-turn output formatting. See spec §6 "Non-interactive output
//! formats".
//!
//! `text` and `raw` are streamed incrementally from the message store's
//! `Event<Message>` subscription as the turn runs; `json` is a single
//! structured object assembled once the turn finishes; `stream-json` prints
//! one NDJSON line per coordinator/agent event as it is observed.

use chrono::Utc;
use serde_json::{json, Value};

use crush_coordinator::TurnOutcome;
use crush_store::{Part, Role, Session};

use crate::cli::OutputFormat;

/// Turn an NDJSON line for `stream-json`: one per message-store event this
/// process observes while the turn runs. Raw and lossless — consumers that
/// want a final summary should use `json` instead.
pub fn stream_json_line(event_kind: &str, message_id: &str, role: Role, parts: &[Part]) -> String {
    let line = json!({
        "event": event_kind,
        "message_id": message_id,
        "role": role.as_str(),
        "parts": parts,
    });
    line.to_string()
}

/// The `json` format's single structured result, built after the turn
/// finishes. Field set matches spec §6 exactly.
pub fn turn_result_json(
    session: &Session,
    outcome: &TurnOutcome,
    model: &str,
    provider: &str,
    input: &str,
    output_text: &str,
    duration_ms: u128,
    turn_count: usize,
    status: &str,
    error: Option<&str>,
    error_code: Option<&str>,
    truncated: bool,
) -> Value {
    json!({
        "version": 1,
        "timestamp": Utc::now().to_rfc3339(),
        "model": model,
        "provider": provider,
        "session": session.id,
        "input": input,
        "output": output_text,
        "input_tokens": outcome.input_tokens,
        "output_tokens": outcome.output_tokens,
        "cache_read_tokens": outcome.cache_read_tokens,
        "cache_write_tokens": outcome.cache_write_tokens,
        "cost": outcome.cost,
        "duration_ms": duration_ms,
        "turn_count": turn_count,
        "tool_call_count": outcome.tool_call_count,
        "status": status,
        "error": error,
        "error_code": error_code,
        "stop_reason": format!("{:?}", outcome.finish_reason).to_lowercase(),
        "truncated": truncated,
    })
}

/// Extract the text the user would read as "the reply" from an assistant
/// message: every `Text` part's content, concatenated. Used for `text` and
/// `raw`.
pub fn assistant_text(parts: &[Part]) -> String {
    let mut out = String::new();
    for part in parts {
        if let Part::Text { text } = part {
            out.push_str(text);
        }
    }
    out
}

/// Whether `format` wants the live per-delta message stream (`text`,
/// `stream-json`) as opposed to a single value printed once the turn is
/// over (`json`, `raw`).
pub fn streams_incrementally(format: OutputFormat) -> bool {
    matches!(format, OutputFormat::Text | OutputFormat::StreamJson)
}
