// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Forwards [`crush_permission::PermissionArbiter`] requests to the
//! connected ACP client's `requestPermission` RPC and relays the reply back
//! as a grant/deny decision. See spec §4.G.

use std::sync::Arc;

use agent_client_protocol::{
    Client, PermissionOption, PermissionOptionId, PermissionOptionKind, RequestPermissionOutcome,
    RequestPermissionRequest, SelectedPermissionOutcome, SessionId, ToolCallUpdate,
    ToolCallUpdateFields,
};
use tracing::warn;

use crush_permission::{PermissionArbiter, PermissionDecision, PermissionRequest};

/// Spawns a task that drains `arbiter`'s request broker for the lifetime of
/// the process and issues one `requestPermission` RPC per request. The
/// arbiter is process-wide (shared by every session, see spec §9), so one
/// bridge task serves all sessions; each request is forwarded concurrently
/// so a slow client reply for one session never blocks another's.
pub fn spawn(arbiter: Arc<PermissionArbiter>, client: Arc<dyn Client>) {
    let mut requests = arbiter.subscribe_requests();
    tokio::spawn(async move {
        while let Some(event) = requests.recv().await {
            let arbiter = arbiter.clone();
            let client = client.clone();
            tokio::spawn(forward_one(arbiter, client, event.payload));
        }
    });
}

async fn forward_one(arbiter: Arc<PermissionArbiter>, client: Arc<dyn Client>, req: PermissionRequest) {
    let options = vec![
        PermissionOption::new(PermissionOptionId::from("allow-once"), "Allow once")
            .kind(PermissionOptionKind::AllowOnce),
        PermissionOption::new(PermissionOptionId::from("allow-always"), "Allow always")
            .kind(PermissionOptionKind::AllowAlways),
        PermissionOption::new(PermissionOptionId::from("deny-once"), "Deny")
            .kind(PermissionOptionKind::RejectOnce),
    ];
    let update = ToolCallUpdateFields::new().title(req.description.clone());
    let acp_req = RequestPermissionRequest::new(
        SessionId::from(req.session_id.as_str()),
        ToolCallUpdate::new(req.tool_call_id.clone(), update),
        options,
    );

    let decision = match client.request_permission(acp_req).await {
        Ok(resp) => match resp.outcome {
            RequestPermissionOutcome::Selected(SelectedPermissionOutcome { option_id, .. }) => {
                match option_id.0.as_ref() {
                    "allow-always" => PermissionDecision::GrantedPersistent,
                    "allow-once" => PermissionDecision::Granted,
                    _ => PermissionDecision::Denied,
                }
            }
            RequestPermissionOutcome::Cancelled(_) => PermissionDecision::Cancelled,
        },
        Err(e) => {
            warn!(error = %e, request_id = %req.id, "requestPermission RPC failed, denying");
            PermissionDecision::Denied
        }
    };

    let result = match decision {
        PermissionDecision::Granted => arbiter.grant(&req.id),
        PermissionDecision::GrantedPersistent => arbiter.grant_persistent(&req.id),
        PermissionDecision::Denied | PermissionDecision::Cancelled => arbiter.deny(&req.id),
    };
    if let Err(e) = result {
        warn!(error = %e, request_id = %req.id, "permission decision arrived after the request timed out or was already resolved");
    }
}
