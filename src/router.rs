use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::idmap::RequestIdMapper;
use crate::proxy::ProxySession;

/// Flat registry of live proxy sessions. Reverse requests and notifications
/// coming off shared downstream connections are routed here using the session
/// prefix embedded in every proxy request id.
#[derive(Default)]
pub struct GlobalRequestRouter {
    sessions: RwLock<HashMap<String, Arc<ProxySession>>>,
}

impl GlobalRequestRouter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, session: Arc<ProxySession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.session_id().to_string(), session);
    }

    pub fn unregister(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.write().unwrap().remove(session_id)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// Resolve the session owning a proxy request id.
    pub fn route(&self, proxy_request_id: &str) -> Option<Arc<ProxySession>> {
        let session_id = RequestIdMapper::session_of(proxy_request_id)?;
        self.get(session_id)
    }

    pub fn all(&self) -> Vec<Arc<ProxySession>> {
        self.sessions.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().unwrap().is_empty()
    }
}
