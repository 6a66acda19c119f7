use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context as AnyhowContext, Result};
use futures::future::join_all;
use rmcp::model::{ClientRequest, SubscribeRequest, SubscribeRequestParam, UnsubscribeRequest, UnsubscribeRequestParam};
use rmcp::serve_client;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::auth::strategy_for;
use crate::capabilities::{is_capability_list_changed, merge_discovered, tool_default_config};
use crate::config::{
    ServerEntity, ServerStore, Settings, TransportKind, User, UserStore,
};
use crate::context::{CachedLists, PersistTargets, ServerContext, ServerStatus};
use crate::events::{server_capabilities_updated, server_status_changed, EventEmitter};
use crate::handler::ProxyClientHandler;
use crate::logging::{LogEvent, LogKind, LogPublisher};
use crate::naming;
use crate::router::GlobalRequestRouter;
use crate::secrets;
use crate::transport::{self, DownstreamTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Tools,
    Resources,
    Prompts,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectReport {
    pub success_servers: Vec<String>,
    pub failed_servers: Vec<FailedServer>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedServer {
    pub server_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerStatusView {
    pub server_id: String,
    pub instance_id: String,
    pub status: &'static str,
    pub user_id: Option<String>,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
    pub last_error: Option<String>,
}

pub struct SupervisorDeps {
    pub server_store: Arc<dyn ServerStore>,
    pub user_store: Arc<dyn UserStore>,
    pub router: Arc<GlobalRequestRouter>,
    pub emitter: Arc<dyn EventEmitter>,
    pub logger: Arc<dyn LogPublisher>,
    pub settings: Settings,
}

#[derive(Default)]
struct Registry {
    by_server: HashMap<String, Arc<ServerContext>>,
    temporary: HashMap<(String, String), Arc<ServerContext>>,
    by_instance: HashMap<String, Arc<ServerContext>>,
}

#[derive(Default)]
struct SubscriptionEntry {
    sessions: HashSet<String>,
    downstream_subscribed: bool,
}

/// Global registry of downstream server contexts plus the resource
/// subscription fan-in. One mutex guards the maps; connection setup happens
/// outside it with the slot held in `Connecting` to prevent duplicate dials.
pub struct ServerSupervisor {
    weak_self: Weak<ServerSupervisor>,
    deps: SupervisorDeps,
    registry: Mutex<Registry>,
    subscriptions: Mutex<HashMap<(String, String), SubscriptionEntry>>,
    next_instance: AtomicU64,
    shutting_down: AtomicBool,
}

impl ServerSupervisor {
    pub fn new(deps: SupervisorDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            deps,
            registry: Mutex::new(Registry::default()),
            subscriptions: Mutex::new(HashMap::new()),
            next_instance: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.deps.settings
    }

    fn next_instance_id(&self) -> String {
        (self.next_instance.fetch_add(1, Ordering::Relaxed) + 1).to_string()
    }

    pub async fn context_by_instance(&self, instance_id: &str) -> Option<Arc<ServerContext>> {
        self.registry
            .lock()
            .await
            .by_instance
            .get(instance_id)
            .cloned()
    }

    pub async fn context_by_server(&self, server_id: &str) -> Option<Arc<ServerContext>> {
        self.registry.lock().await.by_server.get(server_id).cloned()
    }

    /// Shared contexts plus this user's temporary ones.
    pub async fn all_contexts_for(&self, user_id: &str) -> Vec<Arc<ServerContext>> {
        let registry = self.registry.lock().await;
        let mut out: Vec<Arc<ServerContext>> = registry.by_server.values().cloned().collect();
        out.extend(
            registry
                .temporary
                .iter()
                .filter(|((_, uid), _)| uid == user_id)
                .map(|(_, ctx)| ctx.clone()),
        );
        out
    }

    pub async fn status_snapshot(&self) -> Vec<ServerStatusView> {
        let contexts: Vec<Arc<ServerContext>> = {
            let registry = self.registry.lock().await;
            registry.by_instance.values().cloned().collect()
        };
        let mut out: Vec<ServerStatusView> = contexts
            .iter()
            .map(|ctx| {
                let lists = ctx.lists();
                ServerStatusView {
                    server_id: ctx.server_id.clone(),
                    instance_id: ctx.instance_id.clone(),
                    status: ctx.status().as_str(),
                    user_id: ctx.user_id.clone(),
                    tools: lists.tools.len(),
                    resources: lists.resources.len(),
                    prompts: lists.prompts.len(),
                    last_error: ctx.last_error(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        out
    }

    /// Register (or reuse) a shared server and connect it. An existing entry
    /// with the same launch config that is Online or Connecting is returned
    /// as-is; anything else is torn down and recreated.
    pub async fn add_server(
        &self,
        entity: ServerEntity,
        key_source: &str,
    ) -> Result<Arc<ServerContext>> {
        entity.validate().map_err(|e| anyhow!(e))?;
        let launch = secrets::decrypt_launch_config(key_source, &entity.launch_config)
            .context("decrypt launch config")?;

        let ctx = {
            let mut registry = self.registry.lock().await;
            let reusable = registry.by_server.get(&entity.server_id).and_then(|existing| {
                let keep = existing.launch_matches(&launch)
                    && matches!(
                        existing.status(),
                        ServerStatus::Online | ServerStatus::Connecting
                    );
                keep.then(|| existing.clone())
            });
            if let Some(existing) = reusable {
                return Ok(existing);
            }
            if let Some(stale) = registry.by_server.remove(&entity.server_id) {
                registry.by_instance.remove(&stale.instance_id);
                drop(registry);
                self.teardown_context(&stale, "replaced").await;
                registry = self.registry.lock().await;
            }
            let ctx = ServerContext::new(self.next_instance_id(), entity.clone(), None);
            ctx.set_launch_config(launch);
            ctx.set_status(ServerStatus::Connecting);
            registry
                .by_server
                .insert(entity.server_id.clone(), ctx.clone());
            registry
                .by_instance
                .insert(ctx.instance_id.clone(), ctx.clone());
            ctx
        };

        match self.connect_context(&ctx).await {
            Ok(()) => Ok(ctx),
            Err(e) => {
                ctx.set_status(ServerStatus::Error);
                ctx.record_error(e.to_string());
                server_status_changed(self.deps.emitter.as_ref(), &ctx.server_id, "error");
                Err(e)
            }
        }
    }

    /// Register without opening the transport; the first routed request
    /// connects it.
    pub async fn add_sleeping_server(
        &self,
        entity: ServerEntity,
        key_source: &str,
    ) -> Result<Arc<ServerContext>> {
        entity.validate().map_err(|e| anyhow!(e))?;
        let launch = secrets::decrypt_launch_config(key_source, &entity.launch_config)
            .context("decrypt launch config")?;
        let mut registry = self.registry.lock().await;
        if let Some(existing) = registry.by_server.get(&entity.server_id) {
            return Ok(existing.clone());
        }
        let ctx = ServerContext::new(self.next_instance_id(), entity.clone(), None);
        ctx.set_launch_config(launch);
        ctx.set_status(ServerStatus::Sleeping);
        registry
            .by_server
            .insert(entity.server_id.clone(), ctx.clone());
        registry
            .by_instance
            .insert(ctx.instance_id.clone(), ctx.clone());
        info!(target = "supervisor", server = %entity.server_id, instance = %ctx.instance_id, "registered_sleeping");
        Ok(ctx)
    }

    pub async fn remove_server(&self, server_id: &str) {
        let ctx = {
            let mut registry = self.registry.lock().await;
            let ctx = registry.by_server.remove(server_id);
            if let Some(ctx) = &ctx {
                registry.by_instance.remove(&ctx.instance_id);
            }
            ctx
        };
        if let Some(ctx) = ctx {
            self.teardown_context(&ctx, "removed").await;
        }
    }

    pub async fn reconnect_server(
        &self,
        entity: ServerEntity,
        key_source: &str,
    ) -> Result<Arc<ServerContext>> {
        self.remove_server(&entity.server_id).await;
        self.add_server(entity, key_source).await
    }

    /// Connect every enabled shared server concurrently.
    pub async fn connect_all_servers(&self) -> ConnectReport {
        let entities: Vec<ServerEntity> = self
            .deps
            .server_store
            .list()
            .await
            .into_iter()
            .filter(|e| e.enabled && !e.allow_user_input)
            .collect();
        let key = self.deps.settings.secret_key.clone();
        let tasks = entities.into_iter().map(|entity| {
            let key = key.clone();
            async move {
                let server_id = entity.server_id.clone();
                let result = if entity.lazy_start {
                    self.add_sleeping_server(entity, &key).await.map(|_| ())
                } else {
                    self.add_server(entity, &key).await.map(|_| ())
                };
                (server_id, result)
            }
        });
        let mut report = ConnectReport::default();
        for (server_id, result) in join_all(tasks).await {
            match result {
                Ok(()) => report.success_servers.push(server_id),
                Err(e) => report.failed_servers.push(FailedServer {
                    server_id,
                    error: e.to_string(),
                }),
            }
        }
        report
    }

    /// Start the temporary instances a user configured for `allowUserInput`
    /// templates. Called on the user's first session.
    pub async fn start_user_servers(&self, user: &User, token: &str) {
        let entities = self.deps.server_store.list().await;
        for entity in entities {
            if !entity.allow_user_input || !entity.enabled {
                continue;
            }
            let Some(blob) = user.launch_configs.get(&entity.server_id) else {
                continue;
            };
            let key = (entity.server_id.clone(), user.user_id.clone());
            {
                let registry = self.registry.lock().await;
                if registry.temporary.contains_key(&key) {
                    continue;
                }
            }
            let launch = match secrets::decrypt_launch_config(token, blob) {
                Ok(l) => l,
                Err(e) => {
                    warn!(target = "supervisor", server = %entity.server_id, user = %user.user_id, error = %e, "temporary_launch_decrypt_failed");
                    continue;
                }
            };
            let ctx = ServerContext::new(
                self.next_instance_id(),
                entity.clone(),
                Some(user.user_id.clone()),
            );
            ctx.set_launch_config(launch);
            ctx.set_user_token(Some(token.to_string()));
            let lazy = entity.lazy_start;
            ctx.set_status(if lazy {
                ServerStatus::Sleeping
            } else {
                ServerStatus::Connecting
            });
            {
                let mut registry = self.registry.lock().await;
                registry.temporary.insert(key, ctx.clone());
                registry
                    .by_instance
                    .insert(ctx.instance_id.clone(), ctx.clone());
            }
            if !lazy {
                let Some(supervisor) = self.weak_self.upgrade() else {
                    continue;
                };
                tokio::spawn(async move {
                    if let Err(e) = supervisor.connect_context(&ctx).await {
                        ctx.set_status(ServerStatus::Error);
                        ctx.record_error(e.to_string());
                        warn!(target = "supervisor", server = %ctx.server_id, user = ?ctx.user_id, error = %e, "temporary_connect_failed");
                    }
                });
            }
        }
    }

    /// Close the user's temporary instances; called when their last session
    /// ends or a template is deleted.
    pub async fn close_user_servers(&self, user_id: &str) {
        let removed: Vec<Arc<ServerContext>> = {
            let mut registry = self.registry.lock().await;
            let keys: Vec<(String, String)> = registry
                .temporary
                .keys()
                .filter(|(_, uid)| uid == user_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    let ctx = registry.temporary.remove(&k);
                    if let Some(ctx) = &ctx {
                        registry.by_instance.remove(&ctx.instance_id);
                    }
                    ctx
                })
                .collect()
        };
        for ctx in removed {
            self.teardown_context(&ctx, "user_sessions_closed").await;
        }
    }

    /// Make sure a context is connected; lazily dials Sleeping and Offline
    /// contexts and waits out a concurrent Connecting attempt.
    pub async fn ensure_available(&self, ctx: &Arc<ServerContext>) -> Result<()> {
        match ctx.status() {
            ServerStatus::Online => return Ok(()),
            ServerStatus::Connecting => {
                let deadline = Duration::from_secs(self.deps.settings.connect_timeout_secs);
                let started = tokio::time::Instant::now();
                while started.elapsed() < deadline {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    match ctx.status() {
                        ServerStatus::Online => return Ok(()),
                        ServerStatus::Connecting => continue,
                        _ => break,
                    }
                }
                if ctx.status() == ServerStatus::Online {
                    return Ok(());
                }
                return Err(anyhow!("server {} failed to connect", ctx.server_id));
            }
            ServerStatus::Sleeping | ServerStatus::Offline => {}
            ServerStatus::Error => {
                if ctx.auth_fatal() {
                    return Err(anyhow!(
                        "server {} disabled by fatal auth failure",
                        ctx.server_id
                    ));
                }
            }
        }
        ctx.set_status(ServerStatus::Connecting);
        match self.connect_context(ctx).await {
            Ok(()) => Ok(()),
            Err(e) => {
                ctx.set_status(ServerStatus::Error);
                ctx.record_error(e.to_string());
                Err(e)
            }
        }
    }

    /// One reconnect attempt after a forwarding failure. Returns true when
    /// the context came back Online.
    pub async fn try_auto_reconnect(&self, ctx: &Arc<ServerContext>) -> bool {
        if ctx.auth_fatal() || self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(service) = ctx.take_connection().await {
            service.cancellation_token().cancel();
        }
        ctx.set_status(ServerStatus::Connecting);
        match self.connect_context(ctx).await {
            Ok(()) => true,
            Err(e) => {
                ctx.set_status(ServerStatus::Error);
                ctx.record_error(e.to_string());
                false
            }
        }
    }

    async fn teardown_context(&self, ctx: &Arc<ServerContext>, reason: &str) {
        self.deps.logger.publish(
            LogEvent::new(LogKind::ServerClose)
                .server(ctx.server_id.clone()),
        );
        ctx.destroy().await;
        server_status_changed(self.deps.emitter.as_ref(), &ctx.server_id, "offline");
        info!(target = "supervisor", server = %ctx.server_id, instance = %ctx.instance_id, reason = reason, "server_closed");
    }

    /// Dial a context whose launch config is already resolved: auth init,
    /// transport construction, MCP handshake + ping, capability discovery.
    pub async fn connect_context(&self, ctx: &Arc<ServerContext>) -> Result<()> {
        let entity = ctx.entity();
        let launch = ctx
            .launch_config()
            .ok_or_else(|| anyhow!("no launch config resolved for {}", entity.server_id))?;
        server_status_changed(self.deps.emitter.as_ref(), &entity.server_id, "connecting");

        // Auth first: the access token is injected through the launch config
        // and the oauth block (client secret included) never reaches the
        // downstream process.
        let mut effective = launch.clone();
        let strategy = match effective.oauth.take() {
            Some(oauth) => strategy_for(entity.auth_kind, oauth, reqwest::Client::new()),
            None => None,
        };
        if let Some(strategy) = &strategy {
            let token = strategy
                .initial_token()
                .await
                .map_err(|e| anyhow!("auth init for {}: {e}", entity.server_id))?;
            match transport::infer_kind(&effective) {
                Ok(TransportKind::Stdio) => {
                    effective
                        .env
                        .insert("accessToken".to_string(), token.access_token.clone());
                }
                _ => {
                    effective.headers.insert(
                        "Authorization".to_string(),
                        format!("Bearer {}", token.access_token),
                    );
                }
            }
            ctx.set_token(token);
            ctx.set_auth_strategy(Some(strategy.clone()));
        }

        let (transport, kind) = transport::create(&entity.server_id, &effective)
            .await
            .with_context(|| format!("transport for {}", entity.server_id))?;
        ctx.set_transport_kind(kind);

        let handler = ProxyClientHandler::new(
            entity.server_id.clone(),
            ctx.instance_id.clone(),
            self.deps.router.clone(),
            self.weak_self.clone(),
        );
        let connect_timeout = Duration::from_secs(self.deps.settings.connect_timeout_secs);
        let service = match transport {
            DownstreamTransport::Stdio(t) => {
                tokio::time::timeout(connect_timeout, serve_client(handler, t)).await
            }
            DownstreamTransport::StreamableHttp(t) => {
                tokio::time::timeout(connect_timeout, serve_client(handler, t)).await
            }
            DownstreamTransport::Sse(t) => {
                tokio::time::timeout(connect_timeout, serve_client(handler, t)).await
            }
        }
        .map_err(|_| anyhow!("handshake timeout for {}", entity.server_id))?
        .with_context(|| format!("serve client for {}", entity.server_id))?;

        let service = Arc::new(service);
        ctx.set_remote_capabilities(
            service
                .peer()
                .peer_info()
                .map(|info| info.capabilities.clone()),
        );
        ctx.set_connection(service.clone()).await;

        self.refresh_lists(ctx).await?;

        if let Some(strategy) = strategy {
            ctx.persist_rotated_config(strategy.as_ref(), &self.persist_targets(ctx))
                .await;
            ctx.spawn_refresh_loop(self.persist_targets(ctx));
        }

        ctx.clear_error();
        ctx.set_status(ServerStatus::Online);
        self.deps.logger.publish(
            LogEvent::new(LogKind::ServerInit)
                .server(entity.server_id.clone()),
        );
        server_status_changed(self.deps.emitter.as_ref(), &entity.server_id, "online");
        info!(target = "supervisor", server = %entity.server_id, instance = %ctx.instance_id, transport = ?kind, "server_online");
        Ok(())
    }

    fn persist_targets(&self, ctx: &ServerContext) -> PersistTargets {
        PersistTargets {
            server_store: self.deps.server_store.clone(),
            user_store: self.deps.user_store.clone(),
            server_key: self.deps.settings.secret_key.clone(),
            user_key: ctx.user_token(),
        }
    }

    /// Fetch the capability lists and fold them into the stored config.
    /// Per-list failures degrade to empty lists; all-empty falls back to the
    /// template's embedded default config when one exists.
    pub async fn refresh_lists(&self, ctx: &Arc<ServerContext>) -> Result<()> {
        let entity = ctx.entity();
        let service = ctx
            .connection()
            .await
            .ok_or_else(|| anyhow!("no connection for {}", entity.server_id))?;
        let list_timeout = Duration::from_secs(self.deps.settings.list_timeout_secs);

        let tools = match tokio::time::timeout(list_timeout, service.list_all_tools()).await {
            Ok(Ok(items)) => items,
            Ok(Err(e)) => {
                warn!(target = "supervisor", server = %entity.server_id, error = %e, "list_tools_failed");
                Vec::new()
            }
            Err(_) => {
                warn!(target = "supervisor", server = %entity.server_id, "list_tools_timeout");
                Vec::new()
            }
        };
        let resources = match tokio::time::timeout(list_timeout, service.list_all_resources()).await
        {
            Ok(Ok(items)) => items,
            _ => Vec::new(),
        };
        let resource_templates =
            match tokio::time::timeout(list_timeout, service.list_all_resource_templates()).await {
                Ok(Ok(items)) => items,
                _ => Vec::new(),
            };
        let prompts = match tokio::time::timeout(list_timeout, service.list_all_prompts()).await {
            Ok(Ok(items)) => items,
            _ => Vec::new(),
        };

        let all_empty = tools.is_empty()
            && resources.is_empty()
            && resource_templates.is_empty()
            && prompts.is_empty();

        let discovered = if all_empty {
            tool_default_config(entity.config_template.as_ref())
        } else {
            Some(merge_discovered(
                entity.capabilities.as_ref(),
                tools.iter().map(|t| {
                    (
                        t.name.to_string(),
                        t.description.as_ref().map(|d| d.to_string()),
                    )
                }),
                resources.iter().map(|r| {
                    (
                        r.raw.uri.clone(),
                        r.raw.description.as_ref().map(|d| d.to_string()),
                    )
                }),
                prompts.iter().map(|p| {
                    (
                        p.name.clone(),
                        p.description.as_ref().map(|d| d.to_string()),
                    )
                }),
            ))
        };

        ctx.set_lists(CachedLists {
            tools,
            resources,
            resource_templates,
            prompts,
        });

        if let Some(new_config) = discovered {
            let changed = entity
                .capabilities
                .as_ref()
                .map(|old| is_capability_list_changed(old, &new_config))
                .unwrap_or(true);
            if changed {
                if let Err(e) = self
                    .deps
                    .server_store
                    .update_capabilities(&entity.server_id, new_config.clone())
                    .await
                {
                    warn!(target = "supervisor", server = %entity.server_id, error = %e, "capability_persist_failed");
                }
                let mut updated = entity.clone();
                updated.capabilities = Some(new_config);
                ctx.set_entity(updated);
                self.deps.logger.publish(
                    LogEvent::new(LogKind::ServerCapabilityUpdate)
                        .server(entity.server_id.clone()),
                );
                server_capabilities_updated(self.deps.emitter.as_ref(), &entity.server_id);
            }
        }
        Ok(())
    }

    /// A downstream announced a list change: refresh the cache first, then
    /// tell every session, so clients re-list after we observe the new data.
    pub async fn handle_list_changed(&self, instance_id: &str, kind: ListKind) {
        let Some(ctx) = self.context_by_instance(instance_id).await else {
            return;
        };
        if let Err(e) = self.refresh_lists(&ctx).await {
            warn!(target = "supervisor", server = %ctx.server_id, error = %e, "relist_failed");
        }
        for session in self.deps.router.all() {
            session.notify_list_changed(kind).await;
        }
    }

    /// Transport dropped out from under a context: flag it, tell sessions the
    /// aggregate lists shrank, and leave the door open for reconnects.
    pub async fn handle_transport_closed(&self, ctx: &Arc<ServerContext>, error: &str) {
        ctx.set_status(ServerStatus::Error);
        ctx.record_error(error);
        let mut event = LogEvent::new(LogKind::ErrorInternal).server(ctx.server_id.clone());
        event.error = Some(error.to_string());
        self.deps.logger.publish(event);
        server_status_changed(self.deps.emitter.as_ref(), &ctx.server_id, "error");
        for kind in [ListKind::Tools, ListKind::Resources, ListKind::Prompts] {
            for session in self.deps.router.all() {
                session.notify_list_changed(kind).await;
            }
        }
    }

    // ---------- subscription engine ----------

    /// Reference-counted resource subscription: the first subscriber triggers
    /// exactly one downstream subscribe, later ones only join the set.
    pub async fn subscribe_resource(
        &self,
        instance_id: &str,
        uri: &str,
        session_id: &str,
    ) -> Result<()> {
        let ctx = self
            .context_by_instance(instance_id)
            .await
            .ok_or_else(|| anyhow!("unknown server instance {instance_id}"))?;
        let key = (instance_id.to_string(), uri.to_string());
        let need_downstream = {
            let mut subs = self.subscriptions.lock().await;
            let entry = subs.entry(key.clone()).or_default();
            entry.sessions.insert(session_id.to_string());
            !entry.downstream_subscribed
        };
        if need_downstream {
            let result = self.downstream_subscribe(&ctx, uri).await;
            let mut subs = self.subscriptions.lock().await;
            match result {
                Ok(()) => {
                    if let Some(entry) = subs.get_mut(&key) {
                        entry.downstream_subscribed = true;
                    }
                }
                Err(e) => {
                    if let Some(entry) = subs.get_mut(&key) {
                        entry.sessions.remove(session_id);
                        if entry.sessions.is_empty() {
                            subs.remove(&key);
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub async fn unsubscribe_resource(
        &self,
        instance_id: &str,
        uri: &str,
        session_id: &str,
    ) -> Result<()> {
        let key = (instance_id.to_string(), uri.to_string());
        let drop_downstream = {
            let mut subs = self.subscriptions.lock().await;
            match subs.get_mut(&key) {
                Some(entry) => {
                    entry.sessions.remove(session_id);
                    if entry.sessions.is_empty() {
                        let was_subscribed = entry.downstream_subscribed;
                        subs.remove(&key);
                        was_subscribed
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if drop_downstream {
            if let Some(ctx) = self.context_by_instance(instance_id).await {
                self.downstream_unsubscribe(&ctx, uri).await?;
            }
        }
        Ok(())
    }

    pub async fn cleanup_session_subscriptions(&self, session_id: &str) {
        let stale: Vec<(String, String)> = {
            let subs = self.subscriptions.lock().await;
            subs.iter()
                .filter(|(_, entry)| entry.sessions.contains(session_id))
                .map(|(key, _)| key.clone())
                .collect()
        };
        for (instance_id, uri) in stale {
            if let Err(e) = self
                .unsubscribe_resource(&instance_id, &uri, session_id)
                .await
            {
                warn!(target = "supervisor", instance = %instance_id, uri = %uri, error = %e, "session_unsubscribe_failed");
            }
        }
    }

    pub async fn subscriber_count(&self, instance_id: &str, uri: &str) -> usize {
        let subs = self.subscriptions.lock().await;
        subs.get(&(instance_id.to_string(), uri.to_string()))
            .map(|e| e.sessions.len())
            .unwrap_or(0)
    }

    async fn downstream_subscribe(&self, ctx: &Arc<ServerContext>, uri: &str) -> Result<()> {
        let service = ctx
            .connection()
            .await
            .ok_or_else(|| anyhow!("server {} not connected", ctx.server_id))?;
        service
            .send_request(ClientRequest::SubscribeRequest(SubscribeRequest::new(
                SubscribeRequestParam {
                    uri: uri.to_string(),
                },
            )))
            .await
            .map(|_| ())
            .with_context(|| format!("subscribe {} on {}", uri, ctx.server_id))
    }

    async fn downstream_unsubscribe(&self, ctx: &Arc<ServerContext>, uri: &str) -> Result<()> {
        let service = ctx
            .connection()
            .await
            .ok_or_else(|| anyhow!("server {} not connected", ctx.server_id))?;
        service
            .send_request(ClientRequest::UnsubscribeRequest(UnsubscribeRequest::new(
                UnsubscribeRequestParam {
                    uri: uri.to_string(),
                },
            )))
            .await
            .map(|_| ())
            .with_context(|| format!("unsubscribe {} on {}", uri, ctx.server_id))
    }

    /// Resource update from a downstream: fan out to every session subscribed
    /// to that resource, with the uri re-suffixed per session emission rules.
    pub async fn on_resource_updated(&self, instance_id: &str, uri: &str) {
        let sessions: Vec<String> = {
            let subs = self.subscriptions.lock().await;
            subs.get(&(instance_id.to_string(), uri.to_string()))
                .map(|e| e.sessions.iter().cloned().collect())
                .unwrap_or_default()
        };
        let prefixed = naming::prefixed(uri, instance_id);
        for session_id in sessions {
            if let Some(session) = self.deps.router.get(&session_id) {
                session.notify_resource_updated(&prefixed).await;
            }
        }
    }

    /// Idempotent shutdown of every context.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let contexts: Vec<Arc<ServerContext>> = {
            let mut registry = self.registry.lock().await;
            let mut all: Vec<Arc<ServerContext>> = registry.by_instance.values().cloned().collect();
            registry.by_server.clear();
            registry.temporary.clear();
            registry.by_instance.clear();
            all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
            all
        };
        for ctx in contexts {
            self.teardown_context(&ctx, "shutdown").await;
        }
        info!(target = "supervisor", "shutdown_complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthKind, LaunchConfig, MemoryStore, ServerCategory};
    use crate::events::NullEmitter;
    use crate::logging::NullPublisher;

    fn deps(store: Arc<MemoryStore>) -> SupervisorDeps {
        SupervisorDeps {
            server_store: store.clone(),
            user_store: store,
            router: GlobalRequestRouter::new(),
            emitter: Arc::new(NullEmitter),
            logger: Arc::new(NullPublisher),
            settings: crate::config::default_settings(),
        }
    }

    fn entity(id: &str, key: &str) -> ServerEntity {
        let launch = LaunchConfig {
            command: Some("echo".into()),
            ..Default::default()
        };
        ServerEntity {
            server_id: id.into(),
            server_name: id.into(),
            enabled: true,
            category: ServerCategory::Stdio,
            auth_kind: AuthKind::None,
            launch_config: secrets::encrypt_launch_config(key, &launch).unwrap(),
            config_template: None,
            capabilities: None,
            allow_user_input: false,
            lazy_start: true,
            public_access: false,
            proxy_id: None,
        }
    }

    #[tokio::test]
    async fn sleeping_registration_allocates_monotonic_instances() {
        let store = MemoryStore::new();
        let supervisor = ServerSupervisor::new(deps(store));
        let a = supervisor
            .add_sleeping_server(entity("a", "k"), "k")
            .await
            .unwrap();
        let b = supervisor
            .add_sleeping_server(entity("b", "k"), "k")
            .await
            .unwrap();
        assert_eq!(a.instance_id, "1");
        assert_eq!(b.instance_id, "2");
        assert_eq!(a.status(), ServerStatus::Sleeping);
        assert!(supervisor.context_by_instance("1").await.is_some());
        assert!(supervisor.context_by_server("b").await.is_some());
    }

    #[tokio::test]
    async fn remove_server_clears_both_indexes() {
        let store = MemoryStore::new();
        let supervisor = ServerSupervisor::new(deps(store));
        let ctx = supervisor
            .add_sleeping_server(entity("a", "k"), "k")
            .await
            .unwrap();
        supervisor.remove_server("a").await;
        assert!(supervisor.context_by_server("a").await.is_none());
        assert!(supervisor
            .context_by_instance(&ctx.instance_id)
            .await
            .is_none());
        // idempotent
        supervisor.remove_server("a").await;
    }

    #[tokio::test]
    async fn subscription_refcount_tracks_sessions() {
        let store = MemoryStore::new();
        let supervisor = ServerSupervisor::new(deps(store));
        let ctx = supervisor
            .add_sleeping_server(entity("a", "k"), "k")
            .await
            .unwrap();
        let instance = ctx.instance_id.clone();
        // No downstream connection: the first subscribe fails and rolls the
        // refcount back.
        let err = supervisor
            .subscribe_resource(&instance, "file:///x", "s1")
            .await;
        assert!(err.is_err());
        assert_eq!(supervisor.subscriber_count(&instance, "file:///x").await, 0);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = MemoryStore::new();
        let supervisor = ServerSupervisor::new(deps(store));
        supervisor
            .add_sleeping_server(entity("a", "k"), "k")
            .await
            .unwrap();
        supervisor.shutdown().await;
        assert!(supervisor.context_by_server("a").await.is_none());
        supervisor.shutdown().await;
    }
}
