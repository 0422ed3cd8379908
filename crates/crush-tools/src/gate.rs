use async_trait::async_trait;

use crate::tool::{ToolCall, ToolKind};

/// Seam between the registry's dispatch path and whatever actually decides
/// whether a tool call may run. `crush-coordinator` composes the static
/// [`crate::policy::ToolPolicy`] pre-filter with `crush-permission`'s live
/// rendezvous behind one implementation of this trait; tests and sub-agents
/// that never need gating simply don't set one (see
/// [`crate::ToolRegistry::execute_gated`]).
#[async_trait]
pub trait PermissionGate: Send + Sync {
    /// Return `true` if `call` may proceed. Implementations decide how
    /// `ToolKind` maps onto their own approval semantics.
    async fn check(&self, session_id: &str, call: &ToolCall, kind: ToolKind) -> bool;
}
