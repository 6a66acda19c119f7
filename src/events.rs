use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

pub const EVENT_SERVER_STATUS_CHANGED: &str = "mcp:server_status_changed";
pub const EVENT_SERVER_CAPABILITIES_UPDATED: &str = "mcp:server_capabilities_updated";
pub const EVENT_SESSION_CREATED: &str = "mcp:session_created";
pub const EVENT_SESSION_CLOSED: &str = "mcp:session_closed";
pub const EVENT_APPROVAL_REQUESTED: &str = "mcp:approval_requested";

/// Fan-out seam toward the web-UI socket layer. The socket service itself is
/// an external collaborator; the core only pushes payloads through this trait.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: &JsonValue);
}

#[derive(Default, Clone)]
pub struct NullEmitter;

impl EventEmitter for NullEmitter {
    fn emit(&self, _event: &str, _payload: &JsonValue) {}
}

// Helper functions to standardize payload shapes
pub fn server_status_changed(emitter: &dyn EventEmitter, server_id: &str, status: &str) {
    emitter.emit(
        EVENT_SERVER_STATUS_CHANGED,
        &json!({ "server_id": server_id, "status": status }),
    );
}

pub fn server_capabilities_updated(emitter: &dyn EventEmitter, server_id: &str) {
    emitter.emit(
        EVENT_SERVER_CAPABILITIES_UPDATED,
        &json!({ "server_id": server_id }),
    );
}

pub fn session_created(emitter: &dyn EventEmitter, session_id: &str, user_id: &str) {
    emitter.emit(
        EVENT_SESSION_CREATED,
        &json!({ "session_id": session_id, "user_id": user_id }),
    );
}

pub fn session_closed(emitter: &dyn EventEmitter, session_id: &str, reason: &str) {
    emitter.emit(
        EVENT_SESSION_CLOSED,
        &json!({ "session_id": session_id, "reason": reason }),
    );
}

#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub session_id: String,
    pub user_id: String,
    pub server_id: String,
    pub tool: String,
    pub arguments: Option<JsonValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approved,
    Denied,
}

/// Blocking confirmation channel for `Approval`-level tools. The decision
/// arrives out-of-band (the UI socket layer calls `resolve`); the proxy
/// session applies its own deadline around `request_approval`.
#[async_trait]
pub trait ApprovalGateway: Send + Sync {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision;
}

pub struct PendingApprovals {
    emitter: Arc<dyn EventEmitter>,
    pending: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl PendingApprovals {
    pub fn new(emitter: Arc<dyn EventEmitter>) -> Arc<Self> {
        Arc::new(Self {
            emitter,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn new_request_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Called by the out-of-band confirmation surface. Unknown or already
    /// resolved ids are ignored.
    pub async fn resolve(&self, approval_id: &str, approved: bool) {
        let sender = self.pending.lock().await.remove(approval_id);
        if let Some(tx) = sender {
            let _ = tx.send(if approved {
                ApprovalDecision::Approved
            } else {
                ApprovalDecision::Denied
            });
        }
    }
}

#[async_trait]
impl ApprovalGateway for PendingApprovals {
    async fn request_approval(&self, request: ApprovalRequest) -> ApprovalDecision {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .await
            .insert(request.approval_id.clone(), tx);
        self.emitter.emit(
            EVENT_APPROVAL_REQUESTED,
            &json!({
                "approval_id": request.approval_id,
                "session_id": request.session_id,
                "user_id": request.user_id,
                "server_id": request.server_id,
                "tool": request.tool,
                "arguments": request.arguments,
            }),
        );
        match rx.await {
            Ok(decision) => decision,
            // Sender dropped without an answer; treat as denial.
            Err(_) => ApprovalDecision::Denied,
        }
    }
}

/// Gateway that answers every request the same way; test harness helper.
pub struct FixedApprovalGateway(pub ApprovalDecision);

#[async_trait]
impl ApprovalGateway for FixedApprovalGateway {
    async fn request_approval(&self, _request: ApprovalRequest) -> ApprovalDecision {
        self.0
    }
}

#[derive(Default)]
pub struct BufferingEventEmitter(pub std::sync::Mutex<Vec<(String, JsonValue)>>);

impl EventEmitter for BufferingEventEmitter {
    fn emit(&self, event: &str, payload: &JsonValue) {
        self.0
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn helper_payloads_are_emitted() {
        let mock = BufferingEventEmitter::default();
        server_status_changed(&mock, "srv", "online");
        session_created(&mock, "s1", "u1");
        session_closed(&mock, "s1", "expired");
        let events = mock.0.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].0, EVENT_SERVER_STATUS_CHANGED);
        assert_eq!(events[0].1["status"], "online");
        assert_eq!(events[2].1["reason"], "expired");
    }

    #[tokio::test]
    async fn approval_resolution_completes_waiter() {
        let approvals = PendingApprovals::new(Arc::new(BufferingEventEmitter::default()));
        let req = ApprovalRequest {
            approval_id: "ap-1".into(),
            session_id: "s".into(),
            user_id: "u".into(),
            server_id: "srv".into(),
            tool: "rm".into(),
            arguments: None,
        };
        let waiter = {
            let approvals = approvals.clone();
            tokio::spawn(async move { approvals.request_approval(req).await })
        };
        tokio::task::yield_now().await;
        approvals.resolve("ap-1", true).await;
        assert_eq!(waiter.await.unwrap(), ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn unknown_approval_id_is_ignored() {
        let approvals = PendingApprovals::new(Arc::new(NullEmitter));
        approvals.resolve("missing", true).await;
    }
}
