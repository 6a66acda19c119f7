use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Mutex;
use tracing::debug;

use crate::config::{AuthKind, OAuthConfig};

pub const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";
pub const GITHUB_TOKEN_ENDPOINT: &str = "https://github.com/login/oauth/access_token";
pub const NOTION_TOKEN_ENDPOINT: &str = "https://api.notion.com/v1/oauth/token";

/// Cached tokens are reused while at least this much lifetime remains.
pub const TOKEN_REUSE_MARGIN: Duration = Duration::from_secs(5 * 60);
/// Refresh fires this long before expiry.
pub const REFRESH_LEAD: Duration = Duration::from_secs(5 * 60);
/// Floor for the scheduled refresh delay.
pub const MIN_REFRESH_DELAY: Duration = Duration::from_secs(10);
/// Host timer ceiling (i32::MAX milliseconds, the classic setTimeout cap).
pub const MAX_TIMER: Duration = Duration::from_millis(i32::MAX as u64);
/// Backoff before retrying a transient refresh failure.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(3 * 60);

#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AuthError {
    /// Credentials are bad; retrying will not help until an admin intervenes.
    Fatal(String),
    /// Network or server hiccup; retry later.
    Transient(String),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Fatal(m) => write!(f, "fatal auth failure: {m}"),
            AuthError::Transient(m) => write!(f, "transient auth failure: {m}"),
        }
    }
}

impl std::error::Error for AuthError {}

pub fn classify_failure(status: Option<u16>, body: &str) -> AuthError {
    let msg = match status {
        Some(code) => format!("{code}: {body}"),
        None => body.to_string(),
    };
    let fatal_status = matches!(status, Some(400) | Some(401));
    let fatal_text = body.contains("Unauthorized") || body.contains("Bad Request");
    if fatal_status || fatal_text {
        AuthError::Fatal(msg)
    } else {
        AuthError::Transient(msg)
    }
}

/// Delay before the next scheduled refresh: `expiry - now - lead`, floored at
/// `MIN_REFRESH_DELAY` and clamped to the host timer maximum.
pub fn next_refresh_delay(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let until_expiry = (expires_at - now).to_std().unwrap_or(Duration::ZERO);
    let lead = until_expiry.saturating_sub(REFRESH_LEAD);
    lead.clamp(MIN_REFRESH_DELAY, MAX_TIMER)
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn initial_token(&self) -> Result<TokenInfo, AuthError>;
    async fn refresh_token(&self) -> Result<TokenInfo, AuthError>;
    /// Snapshot of the OAuth config when the last refresh changed persistable
    /// state (rotated refresh token, new expiry), `None` otherwise.
    fn current_oauth_config(&self) -> Option<OAuthConfig>;
    fn mark_persisted(&self);
    async fn cleanup(&self) {}
}

pub fn strategy_for(
    kind: AuthKind,
    oauth: OAuthConfig,
    http: reqwest::Client,
) -> Option<Arc<dyn AuthStrategy>> {
    match kind {
        AuthKind::GoogleAuth => Some(Arc::new(GoogleAuth::new(oauth, http))),
        AuthKind::GithubAuth => Some(Arc::new(GithubAuth::new(oauth, http))),
        AuthKind::NotionAuth => Some(Arc::new(NotionAuth::new(oauth, http))),
        AuthKind::None | AuthKind::ApiKey => None,
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

fn default_expires_in() -> u64 {
    3600
}

// Shared cache + rotation bookkeeping for the provider strategies. The
// config mutex is synchronous and never held across an await.
struct OAuthCore {
    config: Mutex<OAuthConfig>,
    dirty: std::sync::atomic::AtomicBool,
}

impl OAuthCore {
    fn new(config: OAuthConfig) -> Self {
        Self {
            config: Mutex::new(config),
            dirty: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn cached(&self) -> Option<TokenInfo> {
        let cfg = self.config.lock().unwrap();
        let (token, expires_at) = (cfg.access_token.clone()?, cfg.expires_at?);
        let remaining = (expires_at - Utc::now()).to_std().ok()?;
        if remaining < TOKEN_REUSE_MARGIN {
            return None;
        }
        Some(TokenInfo {
            access_token: token,
            expires_in: remaining.as_secs(),
            expires_at,
        })
    }

    fn store(&self, response: TokenResponse) -> TokenInfo {
        let expires_at = Utc::now() + chrono::Duration::seconds(response.expires_in as i64);
        let mut cfg = self.config.lock().unwrap();
        cfg.access_token = Some(response.access_token.clone());
        cfg.expires_at = Some(expires_at);
        if let Some(rotated) = response.refresh_token {
            cfg.refresh_token = Some(rotated);
        }
        self.dirty.store(true, std::sync::atomic::Ordering::SeqCst);
        TokenInfo {
            access_token: response.access_token,
            expires_in: response.expires_in,
            expires_at,
        }
    }

    fn snapshot_if_dirty(&self) -> Option<OAuthConfig> {
        if self.dirty.load(std::sync::atomic::Ordering::SeqCst) {
            Some(self.config.lock().unwrap().clone())
        } else {
            None
        }
    }

    fn mark_persisted(&self) {
        self.dirty.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

async fn parse_token_response(
    provider: &str,
    res: Result<reqwest::Response, reqwest::Error>,
) -> Result<TokenResponse, AuthError> {
    let res = res.map_err(|e| AuthError::Transient(format!("{provider} token request: {e}")))?;
    let status = res.status();
    let body = res
        .text()
        .await
        .map_err(|e| AuthError::Transient(format!("{provider} token body: {e}")))?;
    if !status.is_success() {
        return Err(classify_failure(Some(status.as_u16()), &body));
    }
    serde_json::from_str::<TokenResponse>(&body)
        .map_err(|e| AuthError::Transient(format!("{provider} token parse: {e} ({body})")))
}

/// Google: refresh-token grant, form-encoded, client credentials in the body.
pub struct GoogleAuth {
    core: OAuthCore,
    http: reqwest::Client,
}

impl GoogleAuth {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            core: OAuthCore::new(config),
            http,
        }
    }

    async fn fetch(&self) -> Result<TokenInfo, AuthError> {
        let (endpoint, client_id, client_secret, refresh_token) = {
            let cfg = self.core.config.lock().unwrap();
            (
                cfg.token_endpoint
                    .clone()
                    .unwrap_or_else(|| GOOGLE_TOKEN_ENDPOINT.to_string()),
                cfg.client_id.clone(),
                cfg.client_secret.clone().unwrap_or_default(),
                cfg.refresh_token
                    .clone()
                    .ok_or_else(|| AuthError::Fatal("google: no refresh token".into()))?,
            )
        };
        let res = self
            .http
            .post(&endpoint)
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await;
        let parsed = parse_token_response("google", res).await?;
        debug!(target = "auth", provider = "google", expires_in = parsed.expires_in, "token_refreshed");
        Ok(self.core.store(parsed))
    }
}

#[async_trait]
impl AuthStrategy for GoogleAuth {
    async fn initial_token(&self) -> Result<TokenInfo, AuthError> {
        if let Some(tok) = self.core.cached() {
            return Ok(tok);
        }
        self.fetch().await
    }

    async fn refresh_token(&self) -> Result<TokenInfo, AuthError> {
        self.fetch().await
    }

    fn current_oauth_config(&self) -> Option<OAuthConfig> {
        self.core.snapshot_if_dirty()
    }

    fn mark_persisted(&self) {
        self.core.mark_persisted();
    }
}

/// GitHub: form-encoded body, JSON accept header; rotates refresh tokens for
/// expiring installations.
pub struct GithubAuth {
    core: OAuthCore,
    http: reqwest::Client,
}

impl GithubAuth {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            core: OAuthCore::new(config),
            http,
        }
    }

    async fn fetch(&self) -> Result<TokenInfo, AuthError> {
        let (endpoint, client_id, client_secret, refresh_token) = {
            let cfg = self.core.config.lock().unwrap();
            (
                cfg.token_endpoint
                    .clone()
                    .unwrap_or_else(|| GITHUB_TOKEN_ENDPOINT.to_string()),
                cfg.client_id.clone(),
                cfg.client_secret.clone().unwrap_or_default(),
                cfg.refresh_token
                    .clone()
                    .ok_or_else(|| AuthError::Fatal("github: no refresh token".into()))?,
            )
        };
        let res = self
            .http
            .post(&endpoint)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await;
        let parsed = parse_token_response("github", res).await?;
        debug!(target = "auth", provider = "github", expires_in = parsed.expires_in, "token_refreshed");
        Ok(self.core.store(parsed))
    }
}

#[async_trait]
impl AuthStrategy for GithubAuth {
    async fn initial_token(&self) -> Result<TokenInfo, AuthError> {
        if let Some(tok) = self.core.cached() {
            return Ok(tok);
        }
        self.fetch().await
    }

    async fn refresh_token(&self) -> Result<TokenInfo, AuthError> {
        self.fetch().await
    }

    fn current_oauth_config(&self) -> Option<OAuthConfig> {
        self.core.snapshot_if_dirty()
    }

    fn mark_persisted(&self) {
        self.core.mark_persisted();
    }
}

/// Notion: HTTP Basic auth of `clientId:clientSecret`, JSON body, and a
/// rotated refresh token on every exchange.
pub struct NotionAuth {
    core: OAuthCore,
    http: reqwest::Client,
}

impl NotionAuth {
    pub fn new(config: OAuthConfig, http: reqwest::Client) -> Self {
        Self {
            core: OAuthCore::new(config),
            http,
        }
    }

    async fn fetch(&self) -> Result<TokenInfo, AuthError> {
        let (endpoint, client_id, client_secret, refresh_token) = {
            let cfg = self.core.config.lock().unwrap();
            (
                cfg.token_endpoint
                    .clone()
                    .unwrap_or_else(|| NOTION_TOKEN_ENDPOINT.to_string()),
                cfg.client_id.clone(),
                cfg.client_secret.clone().unwrap_or_default(),
                cfg.refresh_token
                    .clone()
                    .ok_or_else(|| AuthError::Fatal("notion: no refresh token".into()))?,
            )
        };
        let res = self
            .http
            .post(&endpoint)
            .basic_auth(client_id, Some(client_secret))
            .json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
            }))
            .send()
            .await;
        let parsed = parse_token_response("notion", res).await?;
        debug!(target = "auth", provider = "notion", expires_in = parsed.expires_in, "token_refreshed");
        Ok(self.core.store(parsed))
    }
}

#[async_trait]
impl AuthStrategy for NotionAuth {
    async fn initial_token(&self) -> Result<TokenInfo, AuthError> {
        if let Some(tok) = self.core.cached() {
            return Ok(tok);
        }
        self.fetch().await
    }

    async fn refresh_token(&self) -> Result<TokenInfo, AuthError> {
        self.fetch().await
    }

    fn current_oauth_config(&self) -> Option<OAuthConfig> {
        self.core.snapshot_if_dirty()
    }

    fn mark_persisted(&self) {
        self.core.mark_persisted();
    }
}
