use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use rmcp::model::RequestId;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// Per-session bidirectional map between the client's request ids and the
// proxy-side ids used toward downstream servers. The proxy id embeds the
// owning session as its first ':'-separated segment so reverse traffic that
// carries only an id can still be routed.

#[derive(Debug, Clone)]
pub struct MappedRequest {
    pub proxy_request_id: String,
    pub uniform_request_id: String,
    pub original: RequestId,
    pub server_id: String,
    pub method: String,
    pub created_at: Instant,
    pub cancel: CancellationToken,
}

pub struct RequestIdMapper {
    session_id: String,
    seq: AtomicU64,
    entries: Mutex<HashMap<String, MappedRequest>>,
}

impl RequestIdMapper {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            seq: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Extract the session segment of a proxy request id.
    pub fn session_of(proxy_request_id: &str) -> Option<&str> {
        let first = proxy_request_id.split(':').next()?;
        if first.is_empty() {
            None
        } else {
            Some(first)
        }
    }

    pub fn register(
        &self,
        original: &RequestId,
        server_id: &str,
        method: &str,
    ) -> MappedRequest {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = Uuid::new_v4().simple().to_string();
        let entry = MappedRequest {
            proxy_request_id: format!("{}:{}:{}", self.session_id, seq, &nonce[..8]),
            uniform_request_id: Uuid::new_v4().to_string(),
            original: original.clone(),
            server_id: server_id.to_string(),
            method: method.to_string(),
            created_at: Instant::now(),
            cancel: CancellationToken::new(),
        };
        self.entries
            .lock()
            .unwrap()
            .insert(entry.proxy_request_id.clone(), entry.clone());
        entry
    }

    pub fn get(&self, proxy_request_id: &str) -> Option<MappedRequest> {
        self.entries.lock().unwrap().get(proxy_request_id).cloned()
    }

    /// Remove on response delivery or cancellation.
    pub fn complete(&self, proxy_request_id: &str) -> Option<MappedRequest> {
        self.entries.lock().unwrap().remove(proxy_request_id)
    }

    /// Fire the cancellation token of the in-flight forward for a client id.
    /// The entry itself is removed by the forwarding path as it unwinds.
    pub fn cancel_by_original(&self, original: &RequestId) -> Option<MappedRequest> {
        let guard = self.entries.lock().unwrap();
        let found = guard.values().find(|e| &e.original == original).cloned();
        if let Some(entry) = &found {
            entry.cancel.cancel();
        }
        found
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}
