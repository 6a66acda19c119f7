use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use rmcp::model::{Prompt, Resource, ResourceTemplate, ServerCapabilities, Tool};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::auth::{
    next_refresh_delay, AuthError, AuthStrategy, TokenInfo, TRANSIENT_RETRY_DELAY,
};
use crate::config::{
    LaunchConfig, ServerEntity, ServerStore, TransportKind, UserStore,
};
use crate::handler::DownstreamService;
use crate::secrets;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Offline,
    Connecting,
    Online,
    Sleeping,
    Error,
}

impl ServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerStatus::Offline => "offline",
            ServerStatus::Connecting => "connecting",
            ServerStatus::Online => "online",
            ServerStatus::Sleeping => "sleeping",
            ServerStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CachedLists {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub resource_templates: Vec<ResourceTemplate>,
    pub prompts: Vec<Prompt>,
}

/// Where rotated OAuth state is written back. User-input servers persist into
/// the owning user's launch_configs keyed by their bearer token; shared
/// servers persist into the entity blob under the proxy secret key.
pub struct PersistTargets {
    pub server_store: Arc<dyn ServerStore>,
    pub user_store: Arc<dyn UserStore>,
    pub server_key: String,
    pub user_key: Option<String>,
}

/// Per-downstream-server state. One per running server, or one per
/// (server, user) pair for user-configured template servers.
pub struct ServerContext {
    weak_self: std::sync::Weak<ServerContext>,
    pub instance_id: String,
    pub server_id: String,
    pub user_id: Option<String>,
    entity: RwLock<ServerEntity>,
    status: RwLock<ServerStatus>,
    lists: RwLock<CachedLists>,
    remote_capabilities: RwLock<Option<ServerCapabilities>>,
    launch: RwLock<Option<LaunchConfig>>,
    transport_kind: RwLock<Option<TransportKind>>,
    connection: tokio::sync::RwLock<Option<Arc<DownstreamService>>>,
    auth: RwLock<Option<Arc<dyn AuthStrategy>>>,
    user_token: RwLock<Option<String>>,
    token: RwLock<Option<TokenInfo>>,
    last_error: RwLock<Option<String>>,
    error_count: AtomicU32,
    auth_fatal: RwLock<bool>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerContext {
    pub fn new(instance_id: String, entity: ServerEntity, user_id: Option<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            instance_id,
            server_id: entity.server_id.clone(),
            user_id,
            entity: RwLock::new(entity),
            status: RwLock::new(ServerStatus::Offline),
            lists: RwLock::new(CachedLists::default()),
            remote_capabilities: RwLock::new(None),
            launch: RwLock::new(None),
            transport_kind: RwLock::new(None),
            connection: tokio::sync::RwLock::new(None),
            auth: RwLock::new(None),
            user_token: RwLock::new(None),
            token: RwLock::new(None),
            last_error: RwLock::new(None),
            error_count: AtomicU32::new(0),
            auth_fatal: RwLock::new(false),
            refresh_task: Mutex::new(None),
        })
    }

    pub fn entity(&self) -> ServerEntity {
        self.entity.read().unwrap().clone()
    }

    pub fn set_entity(&self, entity: ServerEntity) {
        *self.entity.write().unwrap() = entity;
    }

    pub fn status(&self) -> ServerStatus {
        *self.status.read().unwrap()
    }

    pub fn set_status(&self, status: ServerStatus) {
        *self.status.write().unwrap() = status;
    }

    pub fn lists(&self) -> CachedLists {
        self.lists.read().unwrap().clone()
    }

    pub fn set_lists(&self, lists: CachedLists) {
        *self.lists.write().unwrap() = lists;
    }

    pub fn remote_capabilities(&self) -> Option<ServerCapabilities> {
        self.remote_capabilities.read().unwrap().clone()
    }

    pub fn set_remote_capabilities(&self, caps: Option<ServerCapabilities>) {
        *self.remote_capabilities.write().unwrap() = caps;
    }

    pub fn launch_config(&self) -> Option<LaunchConfig> {
        self.launch.read().unwrap().clone()
    }

    pub fn set_launch_config(&self, config: LaunchConfig) {
        *self.launch.write().unwrap() = Some(config);
    }

    /// Structural fingerprint used by addServer to decide reuse vs recreate.
    pub fn launch_matches(&self, other: &LaunchConfig) -> bool {
        let current = self.launch.read().unwrap();
        match current.as_ref() {
            Some(cfg) => {
                serde_json::to_value(cfg).ok() == serde_json::to_value(other).ok()
            }
            None => false,
        }
    }

    pub fn transport_kind(&self) -> Option<TransportKind> {
        *self.transport_kind.read().unwrap()
    }

    pub fn set_transport_kind(&self, kind: TransportKind) {
        *self.transport_kind.write().unwrap() = Some(kind);
    }

    pub async fn connection(&self) -> Option<Arc<DownstreamService>> {
        self.connection.read().await.clone()
    }

    pub async fn set_connection(&self, service: Arc<DownstreamService>) {
        *self.connection.write().await = Some(service);
    }

    pub async fn take_connection(&self) -> Option<Arc<DownstreamService>> {
        self.connection.write().await.take()
    }

    pub fn auth_strategy(&self) -> Option<Arc<dyn AuthStrategy>> {
        self.auth.read().unwrap().clone()
    }

    pub fn set_auth_strategy(&self, strategy: Option<Arc<dyn AuthStrategy>>) {
        *self.auth.write().unwrap() = strategy;
    }

    pub fn user_token(&self) -> Option<String> {
        self.user_token.read().unwrap().clone()
    }

    pub fn set_user_token(&self, token: Option<String>) {
        *self.user_token.write().unwrap() = token;
    }

    pub fn token(&self) -> Option<TokenInfo> {
        self.token.read().unwrap().clone()
    }

    pub fn set_token(&self, token: TokenInfo) {
        *self.token.write().unwrap() = Some(token);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().unwrap().clone()
    }

    pub fn record_error(&self, message: impl Into<String>) -> u32 {
        let message = message.into();
        *self.last_error.write().unwrap() = Some(message);
        self.error_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn clear_error(&self) {
        *self.last_error.write().unwrap() = None;
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn auth_fatal(&self) -> bool {
        *self.auth_fatal.read().unwrap()
    }

    pub fn mark_auth_fatal(&self) {
        *self.auth_fatal.write().unwrap() = true;
    }

    /// Schedule token refreshes for the lifetime of this context. Fatal
    /// failures stop the loop and leave the context unusable until an admin
    /// intervenes; transient failures retry on a short backoff.
    pub fn spawn_refresh_loop(&self, targets: PersistTargets) {
        let Some(token) = self.token() else {
            return;
        };
        let Some(ctx) = self.weak_self.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            let mut delay = next_refresh_delay(token.expires_at, Utc::now());
            loop {
                tokio::time::sleep(delay).await;
                let Some(strategy) = ctx.auth_strategy() else {
                    break;
                };
                match strategy.refresh_token().await {
                    Ok(info) => {
                        info!(target = "context", server = %ctx.server_id, expires_at = %info.expires_at, "token_refreshed");
                        delay = next_refresh_delay(info.expires_at, Utc::now());
                        ctx.set_token(info);
                        ctx.persist_rotated_config(strategy.as_ref(), &targets).await;
                    }
                    Err(AuthError::Transient(msg)) => {
                        warn!(target = "context", server = %ctx.server_id, error = %msg, "token_refresh_transient");
                        ctx.record_error(msg);
                        delay = TRANSIENT_RETRY_DELAY;
                    }
                    Err(AuthError::Fatal(msg)) => {
                        warn!(target = "context", server = %ctx.server_id, error = %msg, "token_refresh_fatal");
                        ctx.record_error(msg);
                        ctx.mark_auth_fatal();
                        break;
                    }
                }
            }
        });
        let mut guard = self.refresh_task.lock().unwrap();
        if let Some(old) = guard.replace(handle) {
            old.abort();
        }
    }

    /// Write rotated OAuth state back into the owning encrypted launch
    /// config, then tell the strategy the snapshot is durable.
    pub async fn persist_rotated_config(
        &self,
        strategy: &dyn AuthStrategy,
        targets: &PersistTargets,
    ) {
        let Some(snapshot) = strategy.current_oauth_config() else {
            return;
        };
        let Some(mut launch) = self.launch_config() else {
            return;
        };
        launch.oauth = Some(snapshot);
        let entity = self.entity();
        let outcome = if entity.allow_user_input {
            match (self.user_id.as_deref(), targets.user_key.as_deref()) {
                (Some(user_id), Some(key)) => match secrets::encrypt_launch_config(key, &launch) {
                    Ok(blob) => {
                        targets
                            .user_store
                            .save_launch_config(user_id, &entity.server_id, blob)
                            .await
                    }
                    Err(e) => Err(e.to_string()),
                },
                _ => Err("user-input server without owner".to_string()),
            }
        } else {
            match secrets::encrypt_launch_config(&targets.server_key, &launch) {
                Ok(blob) => {
                    targets
                        .server_store
                        .update_launch_config(&entity.server_id, blob)
                        .await
                }
                Err(e) => Err(e.to_string()),
            }
        };
        match outcome {
            Ok(()) => {
                self.set_launch_config(launch);
                strategy.mark_persisted();
            }
            Err(e) => {
                warn!(target = "context", server = %self.server_id, error = %e, "persist_rotated_config_failed");
            }
        }
    }

    pub fn abort_refresh(&self) {
        if let Some(handle) = self.refresh_task.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Tear down the context: stop the refresh timer and cancel the
    /// downstream connection. Idempotent.
    pub async fn destroy(&self) {
        self.abort_refresh();
        if let Some(strategy) = self.auth_strategy() {
            strategy.cleanup().await;
        }
        if let Some(service) = self.take_connection().await {
            service.cancellation_token().cancel();
        }
        self.set_status(ServerStatus::Offline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKind, ServerCategory};

    fn entity(id: &str) -> ServerEntity {
        ServerEntity {
            server_id: id.into(),
            server_name: id.into(),
            enabled: true,
            category: ServerCategory::Stdio,
            auth_kind: AuthKind::None,
            launch_config: String::new(),
            config_template: None,
            capabilities: None,
            allow_user_input: false,
            lazy_start: false,
            public_access: false,
            proxy_id: None,
        }
    }

    #[test]
    fn status_transitions_and_errors() {
        let ctx = ServerContext::new("1".into(), entity("a"), None);
        assert_eq!(ctx.status(), ServerStatus::Offline);
        ctx.set_status(ServerStatus::Connecting);
        ctx.set_status(ServerStatus::Online);
        assert_eq!(ctx.status(), ServerStatus::Online);
        assert_eq!(ctx.record_error("boom"), 1);
        assert_eq!(ctx.record_error("boom again"), 2);
        assert_eq!(ctx.last_error().as_deref(), Some("boom again"));
    }

    #[test]
    fn launch_fingerprint_comparison() {
        let ctx = ServerContext::new("1".into(), entity("a"), None);
        let cfg = LaunchConfig {
            command: Some("echo".into()),
            ..Default::default()
        };
        assert!(!ctx.launch_matches(&cfg), "no launch recorded yet");
        ctx.set_launch_config(cfg.clone());
        assert!(ctx.launch_matches(&cfg));
        let other = LaunchConfig {
            command: Some("other".into()),
            ..Default::default()
        };
        assert!(!ctx.launch_matches(&other));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let ctx = ServerContext::new("1".into(), entity("a"), None);
        ctx.set_status(ServerStatus::Online);
        ctx.destroy().await;
        assert_eq!(ctx.status(), ServerStatus::Offline);
        ctx.destroy().await;
        assert_eq!(ctx.status(), ServerStatus::Offline);
    }
}
