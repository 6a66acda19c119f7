mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use mcp_switchboard::auth::{AuthError, AuthStrategy, TokenInfo};
use mcp_switchboard::config::{LaunchConfig, OAuthConfig, ServerStore, UserStore};
use mcp_switchboard::context::{PersistTargets, ServerContext};
use mcp_switchboard::secrets;

// A refresh that rotates the refresh token must land in the right store:
// the user's launch_configs for user-input servers, the server entity blob
// otherwise. The strategy is told once the snapshot is durable.

struct RotatedStrategy {
    dirty: AtomicBool,
}

impl RotatedStrategy {
    fn new() -> Self {
        Self {
            dirty: AtomicBool::new(true),
        }
    }
}

#[async_trait]
impl AuthStrategy for RotatedStrategy {
    async fn initial_token(&self) -> Result<TokenInfo, AuthError> {
        self.refresh_token().await
    }

    async fn refresh_token(&self) -> Result<TokenInfo, AuthError> {
        Ok(TokenInfo {
            access_token: "at-1".into(),
            expires_in: 3600,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    fn current_oauth_config(&self) -> Option<OAuthConfig> {
        if self.dirty.load(Ordering::SeqCst) {
            Some(OAuthConfig {
                client_id: "cid".into(),
                refresh_token: Some("rotated-rt".into()),
                access_token: Some("at-1".into()),
                ..Default::default()
            })
        } else {
            None
        }
    }

    fn mark_persisted(&self) {
        self.dirty.store(false, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn shared_server_rotation_lands_in_the_entity_blob() {
    let h = common::harness().await;
    let entity = common::entity("srv-a");
    h.store.put_server(entity.clone()).await;

    let ctx = ServerContext::new("1".into(), entity, None);
    ctx.set_launch_config(LaunchConfig {
        url: Some("https://api.example.com/mcp".into()),
        ..Default::default()
    });
    let strategy = RotatedStrategy::new();
    let targets = PersistTargets {
        server_store: h.store.clone(),
        user_store: h.store.clone(),
        server_key: common::KEY.to_string(),
        user_key: None,
    };
    ctx.persist_rotated_config(&strategy, &targets).await;

    let stored = ServerStore::get(h.store.as_ref(), "srv-a").await.unwrap();
    let launch = secrets::decrypt_launch_config(common::KEY, &stored.launch_config).unwrap();
    assert_eq!(
        launch.oauth.unwrap().refresh_token.as_deref(),
        Some("rotated-rt")
    );
    assert!(
        strategy.current_oauth_config().is_none(),
        "strategy told the snapshot is durable"
    );
}

#[tokio::test]
async fn user_input_server_rotation_lands_in_the_user_config() {
    let h = common::harness().await;
    let mut entity = common::entity("srv-tpl");
    entity.allow_user_input = true;
    entity.config_template = Some(serde_json::json!({ "env": { "API_KEY": "" } }));
    h.store.put_server(entity.clone()).await;

    let ctx = ServerContext::new("2".into(), entity, Some("u1".into()));
    ctx.set_launch_config(LaunchConfig {
        url: Some("https://api.example.com/mcp".into()),
        ..Default::default()
    });
    let strategy = RotatedStrategy::new();
    let targets = PersistTargets {
        server_store: h.store.clone(),
        user_store: h.store.clone(),
        server_key: common::KEY.to_string(),
        user_key: Some("tok-1".to_string()),
    };
    ctx.persist_rotated_config(&strategy, &targets).await;

    let user = UserStore::get(h.store.as_ref(), "u1").await.unwrap();
    let blob = user.launch_configs.get("srv-tpl").expect("per-user blob");
    let launch = secrets::decrypt_launch_config("tok-1", blob).unwrap();
    assert_eq!(
        launch.oauth.unwrap().refresh_token.as_deref(),
        Some("rotated-rt")
    );
    assert!(strategy.current_oauth_config().is_none());

    // the shared entity blob stays untouched
    let stored = ServerStore::get(h.store.as_ref(), "srv-tpl").await.unwrap();
    let launch = secrets::decrypt_launch_config(common::KEY, &stored.launch_config).unwrap();
    assert!(launch.oauth.is_none());
}

#[tokio::test]
async fn clean_strategy_persists_nothing() {
    let h = common::harness().await;
    let entity = common::entity("srv-a");
    let original_blob = entity.launch_config.clone();
    h.store.put_server(entity.clone()).await;

    let ctx = ServerContext::new("3".into(), entity, None);
    ctx.set_launch_config(LaunchConfig::default());
    let strategy = RotatedStrategy::new();
    strategy.mark_persisted();
    let targets = PersistTargets {
        server_store: h.store.clone(),
        user_store: h.store.clone(),
        server_key: common::KEY.to_string(),
        user_key: None,
    };
    ctx.persist_rotated_config(&strategy, &targets).await;

    let stored = ServerStore::get(h.store.as_ref(), "srv-a").await.unwrap();
    assert_eq!(stored.launch_config, original_blob);
}
