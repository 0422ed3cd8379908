//! Permission arbiter: gates side-effecting tools on an explicit, typed
//! human decision, per session, with cancellation.
//!
//! Mirrors the request/response rendezvous the teacher's tool policy layer
//! (`crush_tools::policy::ToolPolicy`) applies statically (glob patterns
//! evaluated up front) but extended to a live human-in-the-loop channel:
//! `ToolPolicy` decides `Auto`/`Ask`/`Deny` before a call is even attempted;
//! this arbiter is what actually blocks an `Ask` call until a decision
//! arrives.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use crush_broker::{Broker, Event};
use crush_config::PermissionConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A pending request for human (or policy) approval of a side-effecting
/// tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub tool_call_id: String,
    pub action: String,
    pub description: String,
    /// Resolved absolute path of the primary affected resource, or empty.
    pub path: String,
    pub params: serde_json::Value,
}

/// Outcome of a resolved [`PermissionRequest`], as observed by
/// [`PermissionArbiter::subscribe_notifications`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Granted,
    GrantedPersistent,
    Denied,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionNotification {
    pub request_id: String,
    pub session_id: String,
    pub tool_name: String,
    pub decision: PermissionDecision,
}

#[derive(Debug, Error)]
pub enum ArbiterError {
    #[error("no pending permission request with id {0}")]
    RequestNotFound(String),
}

/// `(session_id, tool_name, path_prefix)`.
type GrantKey = (String, String, String);

struct Pending {
    request: PermissionRequest,
    responder: oneshot::Sender<PermissionDecision>,
}

/// Process-wide permission arbiter. Cheap to clone (wraps `Arc`-free
/// interior mutability directly); intended to be held behind a single
/// `Arc<PermissionArbiter>` shared by the coordinator, the tool executor,
/// and the protocol adapter.
pub struct PermissionArbiter {
    skip_requests: Mutex<bool>,
    allowed_tools: Mutex<HashSet<String>>,
    auto_approve_sessions: Mutex<HashSet<String>>,
    persistent_grants: Mutex<HashSet<GrantKey>>,
    pending: Mutex<HashMap<String, Pending>>,
    requests: Broker<PermissionRequest>,
    notifications: Broker<PermissionNotification>,
    timeout: Duration,
}

impl PermissionArbiter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            skip_requests: Mutex::new(false),
            allowed_tools: Mutex::new(HashSet::new()),
            auto_approve_sessions: Mutex::new(HashSet::new()),
            persistent_grants: Mutex::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            requests: Broker::new(crush_broker::DEFAULT_CAPACITY),
            notifications: Broker::new(crush_broker::DEFAULT_CAPACITY),
            timeout,
        }
    }

    pub fn from_config(cfg: &PermissionConfig) -> Self {
        let arbiter = Self::new(Duration::from_secs(cfg.timeout_secs));
        *arbiter.skip_requests.lock().unwrap() = cfg.yolo_mode;
        arbiter
            .allowed_tools
            .lock()
            .unwrap()
            .extend(cfg.allowed_tools.iter().cloned());
        arbiter
            .auto_approve_sessions
            .lock()
            .unwrap()
            .extend(cfg.auto_approve_sessions.iter().cloned());
        arbiter
    }

    /// Toggle `skip_requests` (yolo mode) at runtime, e.g. from the `/yolo`
    /// slash command.
    pub fn set_skip_requests(&self, skip: bool) {
        *self.skip_requests.lock().unwrap() = skip;
    }

    pub fn skip_requests(&self) -> bool {
        *self.skip_requests.lock().unwrap()
    }

    pub fn mark_session_auto_approved(&self, session_id: impl Into<String>) {
        self.auto_approve_sessions.lock().unwrap().insert(session_id.into());
    }

    /// Request a human decision for `req`, blocking until one arrives, the
    /// request times out, or `ctx` cancels. See spec §4.D for the
    /// evaluation order.
    pub async fn request(&self, ctx: &CancellationToken, req: PermissionRequest) -> bool {
        if self.bypasses(&req) {
            debug!(tool = %req.tool_name, session = %req.session_id, "permission bypassed");
            return true;
        }
        if self.has_persistent_grant(&req) {
            debug!(tool = %req.tool_name, path = %req.path, "permission granted by persistent grant");
            return true;
        }

        let (tx, rx) = oneshot::channel();
        let id = req.id.clone();
        self.pending.lock().unwrap().insert(
            id.clone(),
            Pending { request: req.clone(), responder: tx },
        );
        self.requests.publish(Event::created(req.clone()));

        let decision = tokio::select! {
            _ = ctx.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                self.notify(&req, PermissionDecision::Cancelled);
                PermissionDecision::Cancelled
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.pending.lock().unwrap().remove(&id);
                warn!(request_id = %id, "permission request timed out, denying");
                self.notify(&req, PermissionDecision::Denied);
                PermissionDecision::Denied
            }
            result = rx => {
                result.unwrap_or(PermissionDecision::Cancelled)
            }
        };

        matches!(decision, PermissionDecision::Granted | PermissionDecision::GrantedPersistent)
    }

    fn bypasses(&self, req: &PermissionRequest) -> bool {
        *self.skip_requests.lock().unwrap()
            || self.allowed_tools.lock().unwrap().contains(&req.tool_name)
            || self.auto_approve_sessions.lock().unwrap().contains(&req.session_id)
    }

    fn has_persistent_grant(&self, req: &PermissionRequest) -> bool {
        if req.path.is_empty() {
            return false;
        }
        let grants = self.persistent_grants.lock().unwrap();
        grants.iter().any(|(session_id, tool_name, prefix)| {
            session_id == &req.session_id && tool_name == &req.tool_name && req.path.starts_with(prefix)
        })
    }

    /// Grant a single pending request. Idempotent: a request already
    /// resolved (by timeout, cancellation, or a prior decision) is a no-op.
    pub fn grant(&self, request_id: &str) -> Result<(), ArbiterError> {
        self.resolve(request_id, PermissionDecision::Granted)
    }

    pub fn deny(&self, request_id: &str) -> Result<(), ArbiterError> {
        self.resolve(request_id, PermissionDecision::Denied)
    }

    /// Grant a pending request and additionally record a persistent grant
    /// for `(session_id, tool_name, path)` of the originating request.
    pub fn grant_persistent(&self, request_id: &str) -> Result<(), ArbiterError> {
        let pending = self.pending.lock().unwrap().remove(request_id);
        let Some(pending) = pending else {
            return Ok(());
        };
        self.persistent_grants.lock().unwrap().insert((
            pending.request.session_id.clone(),
            pending.request.tool_name.clone(),
            pending.request.path.clone(),
        ));
        self.notify(&pending.request, PermissionDecision::GrantedPersistent);
        let _ = pending.responder.send(PermissionDecision::GrantedPersistent);
        Ok(())
    }

    fn resolve(&self, request_id: &str, decision: PermissionDecision) -> Result<(), ArbiterError> {
        let pending = self.pending.lock().unwrap().remove(request_id);
        let Some(pending) = pending else {
            // First decision already resolved this request; idempotent no-op.
            return Ok(());
        };
        self.notify(&pending.request, decision);
        let _ = pending.responder.send(decision);
        Ok(())
    }

    fn notify(&self, req: &PermissionRequest, decision: PermissionDecision) {
        self.notifications.publish(Event::updated(PermissionNotification {
            request_id: req.id.clone(),
            session_id: req.session_id.clone(),
            tool_name: req.tool_name.clone(),
            decision,
        }));
    }

    /// Deny every outstanding request for `session_id`, e.g. in response to
    /// `Coordinator.Cancel`.
    pub fn deny_all_for_session(&self, session_id: &str) {
        let ids: Vec<String> = self
            .pending
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.request.session_id == session_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            let _ = self.deny(&id);
        }
    }

    pub fn subscribe_requests(&self) -> crush_broker::Subscription<PermissionRequest> {
        self.requests.subscribe()
    }

    pub fn subscribe_notifications(&self) -> crush_broker::Subscription<PermissionNotification> {
        self.notifications.subscribe()
    }
}
