use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::client_session::ClientSession;
use crate::config::{AuthContext, UserStore};
use crate::event_store::EventStore;
use crate::events::{session_closed, session_created, ApprovalGateway, EventEmitter};
use crate::logging::{LogEvent, LogKind, LogPublisher};
use crate::proxy::ProxySession;
use crate::router::GlobalRequestRouter;
use crate::supervisor::ServerSupervisor;

pub struct SessionBundle {
    pub client: Arc<ClientSession>,
    pub proxy: Arc<ProxySession>,
    pub store: Arc<EventStore>,
}

pub struct SessionStoreDeps {
    pub supervisor: Arc<ServerSupervisor>,
    pub router: Arc<GlobalRequestRouter>,
    pub user_store: Arc<dyn UserStore>,
    pub approvals: Arc<dyn ApprovalGateway>,
    pub emitter: Arc<dyn EventEmitter>,
    pub logger: Arc<dyn LogPublisher>,
}

/// Owns every (ClientSession, ProxySession, EventStore) triple, the
/// user→sessions index, and the periodic expiry sweep.
pub struct SessionStore {
    weak_self: std::sync::Weak<SessionStore>,
    deps: SessionStoreDeps,
    sessions: RwLock<HashMap<String, Arc<SessionBundle>>>,
    by_user: RwLock<HashMap<String, HashSet<String>>>,
}

impl SessionStore {
    pub fn new(deps: SessionStoreDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            deps,
            sessions: RwLock::new(HashMap::new()),
            by_user: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<SessionBundle>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions_for_user(&self, user_id: &str) -> Vec<Arc<SessionBundle>> {
        let ids: Vec<String> = self
            .by_user
            .read()
            .await
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        let sessions = self.sessions.read().await;
        ids.iter()
            .filter_map(|id| sessions.get(id).cloned())
            .collect()
    }

    /// Allocate a session for an authenticated user: ids, event store, proxy
    /// wiring, router registration, and the user's temporary servers on their
    /// first concurrent session.
    pub async fn create(&self, token: String, auth: AuthContext) -> Arc<SessionBundle> {
        let session_id = Uuid::new_v4().simple().to_string();
        let user_id = auth.user_id.clone();
        let capacity = self.deps.supervisor.settings().event_store_capacity;

        let client = ClientSession::new(
            session_id.clone(),
            token.clone(),
            auth,
            self.deps.user_store.clone(),
            self.deps.supervisor.clone(),
        );
        let store = Arc::new(EventStore::new(session_id.clone(), capacity));
        let proxy = ProxySession::new(
            client.clone(),
            self.deps.supervisor.clone(),
            store.clone(),
            self.deps.approvals.clone(),
            self.deps.logger.clone(),
        );
        let bundle = Arc::new(SessionBundle {
            client,
            proxy: proxy.clone(),
            store,
        });

        let first_for_user = {
            let mut sessions = self.sessions.write().await;
            let mut by_user = self.by_user.write().await;
            sessions.insert(session_id.clone(), bundle.clone());
            let set = by_user.entry(user_id.clone()).or_default();
            set.insert(session_id.clone());
            set.len() == 1
        };
        self.deps.router.register(proxy);

        self.deps
            .logger
            .publish(LogEvent::new(LogKind::SessionInit).session(session_id.clone()));
        session_created(self.deps.emitter.as_ref(), &session_id, &user_id);
        info!(target = "sessions", session = %session_id, user = %user_id, "session_created");

        if first_for_user {
            if let Some(user) = self.deps.user_store.get(&user_id).await {
                self.deps.supervisor.start_user_servers(&user, &token).await;
            }
        }
        bundle
    }

    /// Tear a session down: close the proxy, drop routing state, release its
    /// subscriptions, and close the user's temporary servers when this was
    /// their last session.
    pub async fn remove(&self, session_id: &str, reason: &str) -> bool {
        let bundle = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(session_id)
        };
        let Some(bundle) = bundle else {
            return false;
        };
        let user_id = bundle.client.user_id.clone();
        let last_for_user = {
            let mut by_user = self.by_user.write().await;
            match by_user.get_mut(&user_id) {
                Some(set) => {
                    set.remove(session_id);
                    let empty = set.is_empty();
                    if empty {
                        by_user.remove(&user_id);
                    }
                    empty
                }
                None => false,
            }
        };

        bundle.proxy.close();
        self.deps.router.unregister(session_id);
        self.deps
            .supervisor
            .cleanup_session_subscriptions(session_id)
            .await;
        bundle.store.clear();

        self.deps
            .logger
            .publish(LogEvent::new(LogKind::SessionClose).session(session_id.to_string()));
        session_closed(self.deps.emitter.as_ref(), session_id, reason);
        info!(target = "sessions", session = %session_id, user = %user_id, reason = reason, "session_closed");

        if last_for_user {
            self.deps.supervisor.close_user_servers(&user_id).await;
        }
        true
    }

    /// Cancel sessions whose auth expired or that sat idle past the timeout.
    pub async fn sweep(&self) -> usize {
        let idle_timeout =
            Duration::from_secs(self.deps.supervisor.settings().idle_timeout_secs);
        let now = Utc::now();
        let expired: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, bundle)| bundle.client.expired(idle_timeout, now))
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut removed = 0;
        for session_id in expired {
            debug!(target = "sessions", session = %session_id, "sweeping expired session");
            if self.remove(&session_id, "expired").await {
                removed += 1;
            }
        }
        removed
    }

    /// Periodic sweep task; runs until the store is dropped.
    pub fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.weak_self.clone();
        let interval = Duration::from_secs(
            self.deps.supervisor.settings().sweep_interval_secs.max(1),
        );
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep().await;
                if removed > 0 {
                    info!(target = "sessions", removed, "sweep_removed_sessions");
                }
            }
        })
    }

    /// Close every session; used on shutdown. Idempotent by construction.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for session_id in ids {
            self.remove(&session_id, "shutdown").await;
        }
    }
}
