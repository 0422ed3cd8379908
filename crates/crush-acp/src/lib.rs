// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! ACP (Agent Client Protocol) server: lifts [`crush_coordinator::Coordinator`]'s
//! session/message event stream onto the wire-level `agent_client_protocol::Agent`
//! surface so any ACP-speaking editor can drive crush over stdio.
//!
//! This crate owns only protocol translation. It holds no conversation state of
//! its own: every notification it emits is derived from a `Coordinator` event,
//! and every inbound request is a thin call into `Coordinator`, `SessionStore`,
//! or `PermissionArbiter`.

mod agent;
mod commands;
mod delta;
mod permission;

pub use agent::CrushAgent;
pub use commands::{SlashCommand, BUILTIN_COMMANDS};
