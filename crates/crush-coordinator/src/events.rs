// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Turn-scoped events that have no representation in the message/session
//! stores but still need a typed broadcast channel for subscribers such as
//! `crush-acp`'s protocol adapter.

use crush_config::AgentMode;
use crush_tools::events::TodoItem;

/// Published on [`crush_broker::Broker<CoordinatorEvent>`] as the coordinator
/// drains `crush_core::AgentEvent`s that don't map onto a message mutation.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    TodoUpdated { session_id: String, todos: Vec<TodoItem> },
    ModeChanged { session_id: String, mode: AgentMode },
    ContextCompacted { session_id: String, tokens_before: usize, tokens_after: usize },
    Question { session_id: String, id: String, questions: Vec<String> },
}
