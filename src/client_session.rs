use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use rmcp::model::{
    ClientCapabilities, ErrorData, Implementation, Prompt, Resource, ResourceTemplate,
    ServerCapabilities, Tool,
};
use serde_json::Value as JsonValue;

use crate::capabilities::{self, Section};
use crate::config::{AuthContext, DangerLevel, User, UserStore};
use crate::context::{ServerContext, ServerStatus};
use crate::naming;
use crate::supervisor::ServerSupervisor;

/// Per-client facade over the supervisor: which servers this user can see,
/// which items survive the permission/preference/config filter, and how names
/// are rewritten on the way out.
pub struct ClientSession {
    pub session_id: String,
    pub user_id: String,
    pub token: String,
    pub auth: AuthContext,
    last_active: RwLock<DateTime<Utc>>,
    client_info: RwLock<Option<Implementation>>,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    user_store: Arc<dyn UserStore>,
    supervisor: Arc<ServerSupervisor>,
}

impl ClientSession {
    pub fn new(
        session_id: String,
        token: String,
        auth: AuthContext,
        user_store: Arc<dyn UserStore>,
        supervisor: Arc<ServerSupervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            user_id: auth.user_id.clone(),
            token,
            auth,
            last_active: RwLock::new(Utc::now()),
            client_info: RwLock::new(None),
            client_capabilities: RwLock::new(None),
            user_store,
            supervisor,
        })
    }

    pub fn touch(&self) {
        *self.last_active.write().unwrap() = Utc::now();
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        *self.last_active.read().unwrap()
    }

    /// Session expiry is min(user expiry, last_active + idle timeout).
    pub fn expired(&self, idle_timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
        if let Some(user_expiry) = self.auth.expires_at {
            if user_expiry < now {
                return true;
            }
        }
        let idle_deadline = self.last_active()
            + chrono::Duration::from_std(idle_timeout).unwrap_or(chrono::Duration::hours(1));
        idle_deadline < now
    }

    pub fn set_client_details(
        &self,
        info: Option<Implementation>,
        capabilities: Option<ClientCapabilities>,
    ) {
        *self.client_info.write().unwrap() = info;
        *self.client_capabilities.write().unwrap() = capabilities;
    }

    pub fn client_info(&self) -> Option<Implementation> {
        self.client_info.read().unwrap().clone()
    }

    pub async fn user(&self) -> Result<User, ErrorData> {
        self.user_store
            .get(&self.user_id)
            .await
            .ok_or_else(|| ErrorData::invalid_request("unknown user for session", None))
    }

    /// A server is accessible when it is enabled, its context is routable
    /// (online, or sleeping with lazy start pending), and either this user
    /// owns the per-user instance or the permission/preference layers allow
    /// the shared one.
    fn context_accessible(&self, ctx: &ServerContext, user: &User) -> bool {
        let entity = ctx.entity();
        if !entity.enabled {
            return false;
        }
        if !matches!(ctx.status(), ServerStatus::Online | ServerStatus::Sleeping) {
            return false;
        }
        if entity.allow_user_input {
            ctx.user_id.as_deref() == Some(self.user_id.as_str())
        } else {
            capabilities::server_enabled_for(user, &entity.server_id)
        }
    }

    pub async fn accessible_contexts(&self) -> Result<(User, Vec<Arc<ServerContext>>), ErrorData> {
        let user = self.user().await?;
        let mut contexts: Vec<Arc<ServerContext>> = self
            .supervisor
            .all_contexts_for(&self.user_id)
            .await
            .into_iter()
            .filter(|ctx| self.context_accessible(ctx, &user))
            .collect();
        contexts.sort_by_key(|ctx| instance_ordinal(&ctx.instance_id));
        Ok((user, contexts))
    }

    pub async fn resolve(
        &self,
        section: Section,
        prefixed: &str,
    ) -> Result<(Arc<ServerContext>, String, User), ErrorData> {
        let (original, instance_id) = naming::split(prefixed).ok_or_else(|| {
            ErrorData::new(
                rmcp::model::ErrorCode::METHOD_NOT_FOUND,
                format!("unknown name: {prefixed}"),
                None,
            )
        })?;
        let ctx = self
            .supervisor
            .context_by_instance(instance_id)
            .await
            .ok_or_else(|| {
                ErrorData::invalid_params(format!("unknown server for name: {prefixed}"), None)
            })?;
        let user = self.user().await?;
        if !self.context_accessible(&ctx, &user) {
            return Err(ErrorData::invalid_params("Permission denied", None));
        }
        let entity = ctx.entity();
        if !capabilities::item_visible(
            entity.capabilities.as_ref(),
            &user,
            &entity.server_id,
            section,
            original,
        ) {
            return Err(ErrorData::invalid_params("Permission denied", None));
        }
        Ok((ctx, original.to_string(), user))
    }

    pub async fn danger_for(&self, ctx: &ServerContext, tool: &str) -> Result<DangerLevel, ErrorData> {
        let user = self.user().await?;
        let entity = ctx.entity();
        let destructive_hint = ctx
            .lists()
            .tools
            .iter()
            .find(|t| t.name == tool)
            .and_then(|t| t.annotations.as_ref())
            .and_then(|a| a.destructive_hint);
        Ok(capabilities::danger_level(
            entity.capabilities.as_ref(),
            &user,
            &entity.server_id,
            tool,
            destructive_hint,
        ))
    }

    pub async fn list_tools(&self) -> Vec<Tool> {
        let Ok((user, contexts)) = self.accessible_contexts().await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for ctx in contexts {
            let entity = ctx.entity();
            let live = ctx.lists().tools;
            let tools: Vec<Tool> = if live.is_empty() && ctx.status() == ServerStatus::Sleeping {
                synthesize_tools(entity.capabilities.as_ref())
            } else {
                live
            };
            for mut tool in tools {
                let name = tool.name.to_string();
                if !capabilities::item_visible(
                    entity.capabilities.as_ref(),
                    &user,
                    &entity.server_id,
                    Section::Tools,
                    &name,
                ) {
                    continue;
                }
                let danger = capabilities::danger_level(
                    entity.capabilities.as_ref(),
                    &user,
                    &entity.server_id,
                    &name,
                    tool.annotations.as_ref().and_then(|a| a.destructive_hint),
                );
                apply_danger_annotations(&mut tool, danger);
                tool.name = naming::prefixed(&name, &ctx.instance_id).into();
                out.push(tool);
            }
        }
        out
    }

    pub async fn list_resources(&self) -> Vec<Resource> {
        let Ok((user, contexts)) = self.accessible_contexts().await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for ctx in contexts {
            let entity = ctx.entity();
            for mut res in ctx.lists().resources {
                let uri = res.raw.uri.clone();
                if !capabilities::item_visible(
                    entity.capabilities.as_ref(),
                    &user,
                    &entity.server_id,
                    Section::Resources,
                    &uri,
                ) {
                    continue;
                }
                res.raw.uri = naming::prefixed(&uri, &ctx.instance_id);
                res.raw.name = naming::prefixed(&res.raw.name, &ctx.instance_id);
                out.push(res);
            }
        }
        out
    }

    pub async fn list_resource_templates(&self) -> Vec<ResourceTemplate> {
        let Ok((_user, contexts)) = self.accessible_contexts().await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for ctx in contexts {
            for mut tpl in ctx.lists().resource_templates {
                tpl.raw.uri_template = naming::prefixed(&tpl.raw.uri_template, &ctx.instance_id);
                tpl.raw.name = naming::prefixed(&tpl.raw.name, &ctx.instance_id);
                out.push(tpl);
            }
        }
        out
    }

    pub async fn list_prompts(&self) -> Vec<Prompt> {
        let Ok((user, contexts)) = self.accessible_contexts().await else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for ctx in contexts {
            let entity = ctx.entity();
            for mut prompt in ctx.lists().prompts {
                let name = prompt.name.clone();
                if !capabilities::item_visible(
                    entity.capabilities.as_ref(),
                    &user,
                    &entity.server_id,
                    Section::Prompts,
                    &name,
                ) {
                    continue;
                }
                prompt.name = naming::prefixed(&name, &ctx.instance_id);
                out.push(prompt);
            }
        }
        out
    }

    /// Capability flags advertised to the client at initialization.
    pub fn advertised_capabilities(&self) -> ServerCapabilities {
        ServerCapabilities::builder()
            .enable_logging()
            .enable_completions()
            .enable_tools()
            .enable_tool_list_changed()
            .enable_resources()
            .enable_resources_subscribe()
            .enable_resources_list_changed()
            .enable_prompts()
            .enable_prompts_list_changed()
            .build()
    }
}

fn instance_ordinal(instance_id: &str) -> (u64, String) {
    match instance_id.parse::<u64>() {
        Ok(n) => (n, String::new()),
        Err(_) => (u64::MAX, instance_id.to_string()),
    }
}

fn synthesize_tools(caps: Option<&crate::config::CapabilityConfig>) -> Vec<Tool> {
    let Some(caps) = caps else {
        return Vec::new();
    };
    caps.tools
        .iter()
        .map(|(name, entry)| {
            Tool::new(
                name.clone(),
                entry.description.clone().unwrap_or_default(),
                default_schema(),
            )
        })
        .collect()
}

fn default_schema() -> serde_json::Map<String, JsonValue> {
    let mut map = serde_json::Map::new();
    map.insert("type".to_string(), JsonValue::String("object".to_string()));
    map
}

fn apply_danger_annotations(tool: &mut Tool, danger: DangerLevel) {
    let mut annotations = tool.annotations.clone().unwrap_or_default();
    match danger {
        DangerLevel::Silent => {
            annotations.read_only_hint = Some(true);
            annotations.destructive_hint = Some(false);
        }
        DangerLevel::Notification | DangerLevel::Approval => {
            annotations.destructive_hint = Some(true);
            annotations.read_only_hint = Some(false);
        }
    }
    tool.annotations = Some(annotations);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn danger_annotation_rewrite() {
        let mut tool = Tool::new("t".to_string(), "d".to_string(), default_schema());
        apply_danger_annotations(&mut tool, DangerLevel::Silent);
        let ann = tool.annotations.clone().unwrap();
        assert_eq!(ann.read_only_hint, Some(true));
        assert_eq!(ann.destructive_hint, Some(false));

        apply_danger_annotations(&mut tool, DangerLevel::Notification);
        let ann = tool.annotations.clone().unwrap();
        assert_eq!(ann.read_only_hint, Some(false));
        assert_eq!(ann.destructive_hint, Some(true));
    }

    #[test]
    fn instance_ordering_is_numeric_first() {
        let mut ids = vec!["10", "2", "1"];
        ids.sort_by_key(|id| instance_ordinal(id));
        assert_eq!(ids, vec!["1", "2", "10"]);
    }
}
