use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::config::{
    CapabilityConfig, CapabilityEntry, DangerLevel, GrantSet, ItemRule, ServerGrant, User,
};

// Composition rules for the filtered capability view: a capability item is
// visible iff server-config-enabled AND permission-enabled AND
// preference-enabled, every side defaulting to true when silent.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Tools,
    Resources,
    Prompts,
}

fn config_section(caps: &CapabilityConfig, section: Section) -> &BTreeMap<String, CapabilityEntry> {
    match section {
        Section::Tools => &caps.tools,
        Section::Resources => &caps.resources,
        Section::Prompts => &caps.prompts,
    }
}

fn grant_section(grant: &ServerGrant, section: Section) -> &std::collections::HashMap<String, ItemRule> {
    match section {
        Section::Tools => &grant.tools,
        Section::Resources => &grant.resources,
        Section::Prompts => &grant.prompts,
    }
}

pub fn grant_for<'a>(set: &'a GrantSet, server_id: &str) -> Option<&'a ServerGrant> {
    set.get(server_id)
}

pub fn server_enabled_for(user: &User, server_id: &str) -> bool {
    let perm = grant_for(&user.permissions, server_id).map(|g| g.enabled).unwrap_or(true);
    let pref = grant_for(&user.preferences, server_id).map(|g| g.enabled).unwrap_or(true);
    perm && pref
}

pub fn item_visible(
    caps: Option<&CapabilityConfig>,
    user: &User,
    server_id: &str,
    section: Section,
    name: &str,
) -> bool {
    let config_enabled = caps
        .and_then(|c| config_section(c, section).get(name))
        .map(|e| e.enabled)
        .unwrap_or(true);
    let perm_enabled = grant_for(&user.permissions, server_id)
        .and_then(|g| grant_section(g, section).get(name))
        .map(|r| r.enabled)
        .unwrap_or(true);
    let pref_enabled = grant_for(&user.preferences, server_id)
        .and_then(|g| grant_section(g, section).get(name))
        .map(|r| r.enabled)
        .unwrap_or(true);
    config_enabled && perm_enabled && pref_enabled
}

/// Effective danger level for a tool: the user's preference wins, then the
/// admin permission, then the server's stored config, then a derivation from
/// the tool's destructive hint (destructive ⇒ Notification, else Silent).
pub fn danger_level(
    caps: Option<&CapabilityConfig>,
    user: &User,
    server_id: &str,
    tool: &str,
    destructive_hint: Option<bool>,
) -> DangerLevel {
    let pref = grant_for(&user.preferences, server_id)
        .and_then(|g| g.tools.get(tool))
        .and_then(|r| r.danger_level);
    if let Some(level) = pref {
        return level;
    }
    let perm = grant_for(&user.permissions, server_id)
        .and_then(|g| g.tools.get(tool))
        .and_then(|r| r.danger_level);
    if let Some(level) = perm {
        return level;
    }
    let stored = caps
        .and_then(|c| c.tools.get(tool))
        .and_then(|e| e.danger_level);
    if let Some(level) = stored {
        return level;
    }
    if destructive_hint == Some(true) {
        DangerLevel::Notification
    } else {
        DangerLevel::Silent
    }
}

/// Structural comparison of two capability configs, insensitive to key
/// ordering on either side.
pub fn is_capability_list_changed(a: &CapabilityConfig, b: &CapabilityConfig) -> bool {
    let va = serde_json::to_value(a).unwrap_or(JsonValue::Null);
    let vb = serde_json::to_value(b).unwrap_or(JsonValue::Null);
    va != vb
}

/// Build a stored capability config from freshly listed names, preserving
/// enablement and danger levels an admin already set for surviving items.
pub fn merge_discovered(
    previous: Option<&CapabilityConfig>,
    tools: impl IntoIterator<Item = (String, Option<String>)>,
    resources: impl IntoIterator<Item = (String, Option<String>)>,
    prompts: impl IntoIterator<Item = (String, Option<String>)>,
) -> CapabilityConfig {
    fn merge_section(
        prev: Option<&BTreeMap<String, CapabilityEntry>>,
        names: impl IntoIterator<Item = (String, Option<String>)>,
    ) -> BTreeMap<String, CapabilityEntry> {
        names
            .into_iter()
            .map(|(name, description)| {
                let mut entry = prev
                    .and_then(|m| m.get(&name))
                    .cloned()
                    .unwrap_or_default();
                entry.description = description;
                (name, entry)
            })
            .collect()
    }
    CapabilityConfig {
        tools: merge_section(previous.map(|c| &c.tools), tools),
        resources: merge_section(previous.map(|c| &c.resources), resources),
        prompts: merge_section(previous.map(|c| &c.prompts), prompts),
    }
}

/// Legacy fallback embedded in a config template. Absent ⇒ no fallback.
pub fn tool_default_config(template: Option<&JsonValue>) -> Option<CapabilityConfig> {
    let raw = template?.get("toolDefaultConfig")?;
    serde_json::from_value(raw.clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{UserRole, UserStatus};

    fn user() -> User {
        User {
            user_id: "u".into(),
            role: UserRole::Member,
            status: UserStatus::Active,
            permissions: Default::default(),
            preferences: Default::default(),
            launch_configs: Default::default(),
            expires_at: None,
            ratelimit: None,
        }
    }

    fn deny_tool(set: &mut GrantSet, server: &str, tool: &str) {
        set.entry(server.to_string()).or_default().tools.insert(
            tool.to_string(),
            ItemRule {
                enabled: false,
                danger_level: None,
            },
        );
    }

    #[test]
    fn visibility_defaults_to_true() {
        let u = user();
        assert!(item_visible(None, &u, "srv", Section::Tools, "search"));
    }

    #[test]
    fn any_denying_layer_hides_item() {
        let mut u = user();
        deny_tool(&mut u.permissions, "srv", "search");
        assert!(!item_visible(None, &u, "srv", Section::Tools, "search"));

        let mut u = user();
        deny_tool(&mut u.preferences, "srv", "search");
        assert!(!item_visible(None, &u, "srv", Section::Tools, "search"));

        let u = user();
        let mut caps = CapabilityConfig::default();
        caps.tools.insert(
            "search".into(),
            CapabilityEntry {
                enabled: false,
                ..Default::default()
            },
        );
        assert!(!item_visible(Some(&caps), &u, "srv", Section::Tools, "search"));
    }

    #[test]
    fn danger_precedence_pref_then_perm_then_config_then_hint() {
        let mut u = user();
        let mut caps = CapabilityConfig::default();
        caps.tools.insert(
            "rm".into(),
            CapabilityEntry {
                danger_level: Some(DangerLevel::Notification),
                ..Default::default()
            },
        );
        assert_eq!(
            danger_level(Some(&caps), &u, "srv", "rm", None),
            DangerLevel::Notification
        );
        u.permissions.entry("srv".into()).or_default().tools.insert(
            "rm".into(),
            ItemRule {
                enabled: true,
                danger_level: Some(DangerLevel::Approval),
            },
        );
        assert_eq!(
            danger_level(Some(&caps), &u, "srv", "rm", None),
            DangerLevel::Approval
        );
        u.preferences.entry("srv".into()).or_default().tools.insert(
            "rm".into(),
            ItemRule {
                enabled: true,
                danger_level: Some(DangerLevel::Silent),
            },
        );
        assert_eq!(
            danger_level(Some(&caps), &u, "srv", "rm", None),
            DangerLevel::Silent
        );
    }

    #[test]
    fn danger_derives_from_destructive_hint() {
        let u = user();
        assert_eq!(danger_level(None, &u, "s", "t", Some(true)), DangerLevel::Notification);
        assert_eq!(danger_level(None, &u, "s", "t", Some(false)), DangerLevel::Silent);
        assert_eq!(danger_level(None, &u, "s", "t", None), DangerLevel::Silent);
    }

    #[test]
    fn list_change_compare_ignores_key_order() {
        let a: CapabilityConfig = serde_json::from_str(
            r#"{"tools":{"a":{"enabled":true},"b":{"enabled":false}}}"#,
        )
        .unwrap();
        let b: CapabilityConfig = serde_json::from_str(
            r#"{"tools":{"b":{"enabled":false},"a":{"enabled":true}}}"#,
        )
        .unwrap();
        assert!(!is_capability_list_changed(&a, &b));
        let c: CapabilityConfig =
            serde_json::from_str(r#"{"tools":{"a":{"enabled":false}}}"#).unwrap();
        assert!(is_capability_list_changed(&a, &c));
    }

    #[test]
    fn merge_keeps_admin_settings_for_surviving_items() {
        let mut prev = CapabilityConfig::default();
        prev.tools.insert(
            "keep".into(),
            CapabilityEntry {
                enabled: false,
                danger_level: Some(DangerLevel::Approval),
                description: None,
            },
        );
        prev.tools.insert("gone".into(), CapabilityEntry::default());
        let merged = merge_discovered(
            Some(&prev),
            vec![
                ("keep".to_string(), Some("d".to_string())),
                ("new".to_string(), None),
            ],
            vec![],
            vec![],
        );
        assert!(!merged.tools["keep"].enabled);
        assert_eq!(merged.tools["keep"].danger_level, Some(DangerLevel::Approval));
        assert!(merged.tools["new"].enabled);
        assert!(!merged.tools.contains_key("gone"));
    }

    #[test]
    fn tool_default_config_absent_means_no_fallback() {
        assert!(tool_default_config(None).is_none());
        let template = serde_json::json!({ "env": {} });
        assert!(tool_default_config(Some(&template)).is_none());
        let template = serde_json::json!({
            "toolDefaultConfig": { "tools": { "x": { "enabled": false } } }
        });
        let cfg = tool_default_config(Some(&template)).unwrap();
        assert!(!cfg.tools["x"].enabled);
    }
}
