// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Forwards [`crush_permission::PermissionArbiter`] requests to a `y/N/a`
//! stdin prompt for the headless CLI, mirroring `crush-acp`'s
//! `requestPermission` bridge but over a terminal instead of the wire
//! protocol. Not used for the ACP server path — there the connected editor
//! answers permission requests itself.

use std::io::Write as _;
use std::sync::Arc;

use tracing::warn;

use crush_permission::{PermissionArbiter, PermissionDecision, PermissionRequest};

/// Spawns a task that drains `arbiter`'s request broker for the lifetime of
/// the process and prompts on stdin/stderr for each one. Requests are
/// handled one at a time (unlike the ACP bridge's concurrent forwarding) —
/// a headless run has exactly one terminal, so concurrent prompts would
/// interleave into garbage.
pub fn spawn(arbiter: Arc<PermissionArbiter>) {
    let mut requests = arbiter.subscribe_requests();
    tokio::spawn(async move {
        while let Some(event) = requests.recv().await {
            forward_one(&arbiter, event.payload).await;
        }
    });
}

async fn forward_one(arbiter: &Arc<PermissionArbiter>, req: PermissionRequest) {
    let request_id = req.id.clone();
    let decision = tokio::task::spawn_blocking(move || prompt(&req))
        .await
        .unwrap_or(PermissionDecision::Denied);

    let result = match decision {
        PermissionDecision::Granted => arbiter.grant(&request_id),
        PermissionDecision::GrantedPersistent => arbiter.grant_persistent(&request_id),
        PermissionDecision::Denied | PermissionDecision::Cancelled => arbiter.deny(&request_id),
    };
    if let Err(e) = result {
        warn!(error = %e, request_id = %request_id, "permission decision arrived after the request timed out or was already resolved");
    }
}

fn prompt(req: &PermissionRequest) -> PermissionDecision {
    eprintln!();
    eprintln!("permission requested: {}", req.description);
    if !req.path.is_empty() {
        eprintln!("  path: {}", req.path);
    }
    eprint!("allow? [y/N/a=always] ");
    let _ = std::io::stderr().flush();

    let mut line = String::new();
    if std::io::stdin().read_line(&mut line).is_err() {
        return PermissionDecision::Denied;
    }
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => PermissionDecision::Granted,
        "a" | "always" => PermissionDecision::GrantedPersistent,
        _ => PermissionDecision::Denied,
    }
}
