mod common;

use std::sync::Arc;

use mcp_switchboard::config::{default_settings, CapabilityEntry, DangerLevel};
use mcp_switchboard::events::{ApprovalDecision, FixedApprovalGateway};
use rmcp::model::ClientJsonRpcMessage;
use serde_json::json;

fn call_frame(name: &str) -> ClientJsonRpcMessage {
    serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": { "name": name, "arguments": {} },
    }))
    .unwrap()
}

// An Approval-level tool must not touch the downstream when the client UI
// rejects (or never answers) the confirmation.

#[tokio::test]
async fn rejected_approval_denies_the_call() {
    let h = common::harness_with(
        default_settings(),
        Arc::new(FixedApprovalGateway(ApprovalDecision::Denied)),
    )
    .await;
    let mut entity = common::entity("srv-a");
    entity
        .capabilities
        .as_mut()
        .unwrap()
        .tools
        .insert(
            "rm".to_string(),
            CapabilityEntry {
                enabled: true,
                danger_level: Some(DangerLevel::Approval),
                description: None,
            },
        );
    let ctx = h.online_server(entity, &["rm"]).await;
    let bundle = h.session().await;

    let frame = bundle
        .proxy
        .handle_message(call_frame(&format!("rm_-_{}", ctx.instance_id)))
        .await
        .expect("a denial response frame");
    assert_eq!(frame["error"]["message"], "User denied tool execution");
    assert_eq!(frame["error"]["code"], -32600);
}

#[tokio::test]
async fn silent_tools_skip_the_gateway() {
    // A gateway that denies everything: if the proxy consulted it for a
    // Silent tool the call would fail with a denial instead of the
    // connection error below.
    let h = common::harness_with(
        default_settings(),
        Arc::new(FixedApprovalGateway(ApprovalDecision::Denied)),
    )
    .await;
    let ctx = h.online_server_with_tools("srv-a", &["list"]).await;
    // keep the forward failure local: no reconnect attempts against the
    // fake context
    ctx.mark_auth_fatal();
    let bundle = h.session().await;

    let frame = bundle
        .proxy
        .handle_message(call_frame(&format!("list_-_{}", ctx.instance_id)))
        .await
        .expect("a response frame");
    let message = frame["error"]["message"].as_str().unwrap_or_default();
    assert_ne!(message, "User denied tool execution");
}
