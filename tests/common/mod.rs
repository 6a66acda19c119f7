#![allow(dead_code)]

use std::sync::Arc;

use mcp_switchboard::config::{
    default_settings, AuthContext, AuthKind, CapabilityConfig, LaunchConfig, MemoryStore,
    ServerCategory, ServerEntity, Settings, User, UserRole, UserStatus,
};
use mcp_switchboard::context::{ServerContext, ServerStatus};
use mcp_switchboard::events::{ApprovalDecision, ApprovalGateway, FixedApprovalGateway, NullEmitter};
use mcp_switchboard::logging::NullPublisher;
use mcp_switchboard::router::GlobalRequestRouter;
use mcp_switchboard::secrets;
use mcp_switchboard::session_store::{SessionBundle, SessionStore, SessionStoreDeps};
use mcp_switchboard::supervisor::{ServerSupervisor, SupervisorDeps};

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub router: Arc<GlobalRequestRouter>,
    pub supervisor: Arc<ServerSupervisor>,
    pub sessions: Arc<SessionStore>,
}

pub const KEY: &str = "change-me";

pub fn member(user_id: &str) -> User {
    User {
        user_id: user_id.into(),
        role: UserRole::Member,
        status: UserStatus::Active,
        permissions: Default::default(),
        preferences: Default::default(),
        launch_configs: Default::default(),
        expires_at: None,
        ratelimit: None,
    }
}

pub fn entity(server_id: &str) -> ServerEntity {
    let launch = LaunchConfig {
        command: Some("echo".into()),
        ..Default::default()
    };
    ServerEntity {
        server_id: server_id.into(),
        server_name: server_id.into(),
        enabled: true,
        category: ServerCategory::Stdio,
        auth_kind: AuthKind::None,
        launch_config: secrets::encrypt_launch_config(KEY, &launch).unwrap(),
        config_template: None,
        capabilities: Some(CapabilityConfig::default()),
        allow_user_input: false,
        lazy_start: true,
        public_access: false,
        proxy_id: None,
    }
}

pub async fn harness() -> Harness {
    harness_with(default_settings(), Arc::new(FixedApprovalGateway(ApprovalDecision::Approved)))
        .await
}

pub async fn harness_with(
    settings: Settings,
    approvals: Arc<dyn ApprovalGateway>,
) -> Harness {
    let store = MemoryStore::new();
    store.put_user(member("u1")).await;
    store.put_token("tok-1", "u1").await;
    let router = GlobalRequestRouter::new();
    let supervisor = ServerSupervisor::new(SupervisorDeps {
        server_store: store.clone(),
        user_store: store.clone(),
        router: router.clone(),
        emitter: Arc::new(NullEmitter),
        logger: Arc::new(NullPublisher),
        settings,
    });
    let sessions = SessionStore::new(SessionStoreDeps {
        supervisor: supervisor.clone(),
        router: router.clone(),
        user_store: store.clone(),
        approvals,
        emitter: Arc::new(NullEmitter),
        logger: Arc::new(NullPublisher),
    });
    Harness {
        store,
        router,
        supervisor,
        sessions,
    }
}

impl Harness {
    /// Register a server and put its context Online with the given tools,
    /// without opening a real transport.
    pub async fn online_server_with_tools(
        &self,
        server_id: &str,
        tools: &[&str],
    ) -> Arc<ServerContext> {
        self.online_server(entity(server_id), tools).await
    }

    pub async fn online_server(
        &self,
        entity: ServerEntity,
        tools: &[&str],
    ) -> Arc<ServerContext> {
        self.store.put_server(entity.clone()).await;
        let ctx = self
            .supervisor
            .add_sleeping_server(entity, KEY)
            .await
            .unwrap();
        let mut lists = mcp_switchboard::context::CachedLists::default();
        let schema: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(serde_json::json!({ "type": "object" })).unwrap();
        for tool in tools {
            lists
                .tools
                .push(rmcp::model::Tool::new(tool.to_string(), "", schema.clone()));
        }
        ctx.set_lists(lists);
        ctx.set_status(ServerStatus::Online);
        ctx
    }

    pub async fn session(&self) -> Arc<SessionBundle> {
        let auth = AuthContext {
            user_id: "u1".into(),
            role: UserRole::Member,
            expires_at: None,
        };
        self.sessions.create("tok-1".into(), auth).await
    }
}
