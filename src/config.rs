use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::PathBuf,
    sync::Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;

// Entities and repository traits shared across the proxy core. The storage
// engine itself lives behind the repository traits; the core only ever sees
// the typed shapes below.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerCategory {
    Stdio,
    RestApi,
    CustomRemote,
    Template,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    None,
    ApiKey,
    GoogleAuth,
    NotionAuth,
    GithubAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    Silent,
    Notification,
    Approval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

/// Decrypted launch configuration. The persisted form is an encrypted blob;
/// see `secrets` for the at-rest format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<TransportKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint: Option<String>,
}

/// Per-item slice of a server's cached capability config. `enabled` defaults
/// to true so a freshly discovered item is visible until an admin says
/// otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityEntry {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danger_level: Option<DangerLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Default for CapabilityEntry {
    fn default() -> Self {
        Self {
            enabled: true,
            danger_level: None,
            description: None,
        }
    }
}

// BTreeMap keeps the persisted form key-ordered so structural comparison is
// insensitive to insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityConfig {
    #[serde(default)]
    pub tools: BTreeMap<String, CapabilityEntry>,
    #[serde(default)]
    pub resources: BTreeMap<String, CapabilityEntry>,
    #[serde(default)]
    pub prompts: BTreeMap<String, CapabilityEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntity {
    pub server_id: String,
    pub server_name: String,
    pub enabled: bool,
    pub category: ServerCategory,
    pub auth_kind: AuthKind,
    /// Encrypted blob; decrypt via `secrets::decrypt_blob`.
    pub launch_config: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_template: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilityConfig>,
    #[serde(default)]
    pub allow_user_input: bool,
    #[serde(default)]
    pub lazy_start: bool,
    #[serde(default)]
    pub public_access: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
}

impl ServerEntity {
    /// `allowUserInput` requires a non-empty config template; the flag itself
    /// is immutable after creation, so this is checked once at admission.
    pub fn validate(&self) -> Result<(), String> {
        if self.allow_user_input
            && self
                .config_template
                .as_ref()
                .map(|t| t.is_null())
                .unwrap_or(true)
        {
            return Err(format!(
                "server {}: allow_user_input requires a config template",
                self.server_id
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemRule {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danger_level: Option<DangerLevel>,
}

/// Per-server slice of a permission (or preference) set. Absent entries mean
/// "allowed" throughout; only explicit denials restrict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerGrant {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub tools: HashMap<String, ItemRule>,
    #[serde(default)]
    pub resources: HashMap<String, ItemRule>,
    #[serde(default)]
    pub prompts: HashMap<String, ItemRule>,
}

impl Default for ServerGrant {
    fn default() -> Self {
        Self {
            enabled: true,
            tools: HashMap::new(),
            resources: HashMap::new(),
            prompts: HashMap::new(),
        }
    }
}

pub type GrantSet = HashMap<String, ServerGrant>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub role: UserRole,
    pub status: UserStatus,
    /// Admin-assigned grants, keyed by server id.
    #[serde(default)]
    pub permissions: GrantSet,
    /// User-owned overlay with the same shape.
    #[serde(default)]
    pub preferences: GrantSet,
    /// serverId -> encrypted per-user launch config.
    #[serde(default)]
    pub launch_configs: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ratelimit: Option<u32>,
}

fn default_true() -> bool {
    true
}

/// Identity resolved from a bearer token. Permission data is read live from
/// the user store so admin changes take effect mid-session.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub role: UserRole,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseTimeouts {
    pub sampling_ms: u64,
    pub roots_ms: u64,
    pub elicitation_ms: u64,
}

impl Default for ReverseTimeouts {
    fn default() -> Self {
        Self {
            sampling_ms: 120_000,
            roots_ms: 30_000,
            elicitation_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub listen_addr: String,
    pub base_url: String,
    /// Key material for server-level launch-config encryption.
    pub secret_key: String,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub event_store_capacity: usize,
    pub approval_timeout_ms: u64,
    pub connect_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub reverse_timeouts: ReverseTimeouts,
}

pub fn default_settings() -> Settings {
    Settings {
        listen_addr: "127.0.0.1:8091".to_string(),
        base_url: "http://localhost:8091".to_string(),
        secret_key: "change-me".to_string(),
        idle_timeout_secs: 3600,
        sweep_interval_secs: 300,
        event_store_capacity: 1024,
        approval_timeout_ms: 55_000,
        connect_timeout_secs: 5,
        list_timeout_secs: 6,
        request_timeout_secs: 300,
        reverse_timeouts: ReverseTimeouts::default(),
    }
}

// Config paths abstraction to make IO testable
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join("app.mcp.switchboard")
    }
}

pub fn settings_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("settings.json")
}

pub fn load_settings_with(cp: &dyn ConfigProvider) -> Settings {
    let path = settings_path(cp);
    if let Ok(content) = fs::read_to_string(&path) {
        if let Ok(s) = serde_json::from_str::<Settings>(&content) {
            return s;
        }
    }
    default_settings()
}

pub fn save_settings_with(cp: &dyn ConfigProvider, settings: &Settings) -> Result<(), String> {
    fs::create_dir_all(cp.base_dir()).map_err(|e| format!("create config dir: {e}"))?;
    let path = settings_path(cp);
    let content = serde_json::to_string_pretty(settings).map_err(|e| format!("to json: {e}"))?;
    fs::write(&path, content).map_err(|e| format!("write settings: {e}"))
}

/// Single-process seed for the in-memory repositories, read from
/// `store.json` under the config directory. Real deployments implement the
/// repository traits against the external storage engine instead.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSeed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub servers: Vec<ServerEntity>,
    /// bearer token -> user id
    #[serde(default)]
    pub tokens: HashMap<String, String>,
}

pub fn load_store_seed_with(cp: &dyn ConfigProvider) -> StoreSeed {
    let path = cp.base_dir().join("store.json");
    if let Ok(content) = fs::read_to_string(&path) {
        if let Ok(seed) = serde_json::from_str::<StoreSeed>(&content) {
            return seed;
        }
    }
    StoreSeed::default()
}

// ---------- repositories ----------

#[async_trait]
pub trait ServerStore: Send + Sync {
    async fn list(&self) -> Vec<ServerEntity>;
    async fn get(&self, server_id: &str) -> Option<ServerEntity>;
    async fn update_capabilities(
        &self,
        server_id: &str,
        caps: CapabilityConfig,
    ) -> Result<(), String>;
    async fn update_launch_config(&self, server_id: &str, blob: String) -> Result<(), String>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Option<User>;
    async fn save_launch_config(
        &self,
        user_id: &str,
        server_id: &str,
        blob: String,
    ) -> Result<(), String>;
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Option<AuthContext>;
}

/// In-memory store used by tests and single-process deployments. The real
/// deployment wires these traits to the external storage engine.
#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<String, User>>,
    servers: RwLock<HashMap<String, ServerEntity>>,
    tokens: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn put_user(&self, user: User) {
        self.users.write().await.insert(user.user_id.clone(), user);
    }

    pub async fn put_server(&self, entity: ServerEntity) {
        self.servers
            .write()
            .await
            .insert(entity.server_id.clone(), entity);
    }

    pub async fn put_token(&self, token: &str, user_id: &str) {
        self.tokens
            .write()
            .await
            .insert(token.to_string(), user_id.to_string());
    }
}

#[async_trait]
impl ServerStore for MemoryStore {
    async fn list(&self) -> Vec<ServerEntity> {
        let mut out: Vec<ServerEntity> = self.servers.read().await.values().cloned().collect();
        out.sort_by(|a, b| a.server_id.cmp(&b.server_id));
        out
    }

    async fn get(&self, server_id: &str) -> Option<ServerEntity> {
        self.servers.read().await.get(server_id).cloned()
    }

    async fn update_capabilities(
        &self,
        server_id: &str,
        caps: CapabilityConfig,
    ) -> Result<(), String> {
        let mut guard = self.servers.write().await;
        let entity = guard
            .get_mut(server_id)
            .ok_or_else(|| format!("unknown server {server_id}"))?;
        entity.capabilities = Some(caps);
        Ok(())
    }

    async fn update_launch_config(&self, server_id: &str, blob: String) -> Result<(), String> {
        let mut guard = self.servers.write().await;
        let entity = guard
            .get_mut(server_id)
            .ok_or_else(|| format!("unknown server {server_id}"))?;
        entity.launch_config = blob;
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Option<User> {
        self.users.read().await.get(user_id).cloned()
    }

    async fn save_launch_config(
        &self,
        user_id: &str,
        server_id: &str,
        blob: String,
    ) -> Result<(), String> {
        let mut guard = self.users.write().await;
        let user = guard
            .get_mut(user_id)
            .ok_or_else(|| format!("unknown user {user_id}"))?;
        user.launch_configs.insert(server_id.to_string(), blob);
        Ok(())
    }
}

#[async_trait]
impl TokenVerifier for MemoryStore {
    async fn verify(&self, token: &str) -> Option<AuthContext> {
        let user_id = self.tokens.read().await.get(token).cloned()?;
        let user = self.users.read().await.get(&user_id).cloned()?;
        if user.status != UserStatus::Active {
            return None;
        }
        if let Some(expiry) = user.expires_at {
            if expiry < Utc::now() {
                return None;
            }
        }
        Some(AuthContext {
            user_id: user.user_id,
            role: user.role,
            expires_at: user.expires_at,
        })
    }
}
