//! Composes the static [`ToolPolicy`] pre-filter with the live
//! [`PermissionArbiter`] rendezvous behind one [`PermissionGate`], per
//! the arbiter crate's own doc comment on how the two layers relate.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crush_permission::{PermissionArbiter, PermissionRequest};
use crush_tools::{permission_path, ApprovalPolicy, PermissionGate, ToolCall, ToolKind, ToolPolicy};

/// Binds a [`ToolPolicy`] and a shared [`PermissionArbiter`] to the
/// [`PermissionGate`] seam `crush-tools`' registry dispatches through.
///
/// `Read`/`Search`/`Fetch`/`Other` calls never reach the arbiter — of this
/// codebase's tool set only `Edit` and `Execute` have a filesystem/shell
/// side effect worth gating (see SPEC_FULL.md's resolution of the "tool kind
/// to gating mapping" open question). Those two kinds are checked against the
/// static glob patterns first (a `Deny` match short-circuits without ever
/// publishing a request); a pattern match of `Ask`, or no match at all,
/// blocks on the arbiter's request/response rendezvous.
pub struct ArbiterGate {
    policy: ToolPolicy,
    arbiter: Arc<PermissionArbiter>,
    /// Cancellation scope for in-flight permission requests, one per active
    /// turn. `Coordinator::cancel` cancels the token for its session so any
    /// outstanding `request()` resolves `Denied` immediately rather than
    /// waiting out the full timeout.
    cancel: CancellationToken,
}

impl ArbiterGate {
    pub fn new(policy: ToolPolicy, arbiter: Arc<PermissionArbiter>, cancel: CancellationToken) -> Self {
        Self { policy, arbiter, cancel }
    }
}

#[async_trait]
impl PermissionGate for ArbiterGate {
    async fn check(&self, session_id: &str, call: &ToolCall, kind: ToolKind) -> bool {
        if matches!(kind, ToolKind::Read | ToolKind::Search | ToolKind::Fetch | ToolKind::Other) {
            return true;
        }

        let subject = permission_path(call).unwrap_or_else(|| call.name.clone());
        match self.policy.decide(&subject) {
            ApprovalPolicy::Deny => false,
            ApprovalPolicy::Auto => true,
            ApprovalPolicy::Ask => {
                let req = PermissionRequest {
                    id: Uuid::new_v4().to_string(),
                    session_id: session_id.to_string(),
                    tool_name: call.name.clone(),
                    tool_call_id: call.id.clone(),
                    action: format!("{kind:?}").to_lowercase(),
                    description: format!("{} wants to run `{}`", call.name, subject),
                    path: permission_path(call).unwrap_or_default(),
                    params: call.args.clone(),
                };
                self.arbiter.request(&self.cancel, req).await
            }
        }
    }
}
