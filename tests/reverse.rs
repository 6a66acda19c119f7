mod common;

use std::sync::Arc;
use std::time::Duration;

use mcp_switchboard::config::{default_settings, ReverseTimeouts};
use mcp_switchboard::events::{ApprovalDecision, FixedApprovalGateway};
use rmcp::model::{ClientJsonRpcMessage, RequestId};
use serde_json::json;

async fn reverse_harness() -> common::Harness {
    let mut settings = default_settings();
    settings.reverse_timeouts = ReverseTimeouts {
        sampling_ms: 100,
        roots_ms: 100,
        elicitation_ms: 100,
    };
    common::harness_with(
        settings,
        Arc::new(FixedApprovalGateway(ApprovalDecision::Approved)),
    )
    .await
}

async fn first_frame(
    store: &mcp_switchboard::event_store::EventStore,
) -> serde_json::Value {
    for _ in 0..100 {
        if let Some(event) = store.replay_after(0).into_iter().next() {
            return event.payload;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no frame appeared on the session stream");
}

// A server-initiated request carrying a proxyContext id must reach the
// owning session, be rewritten to the client's own request id, and resolve
// with the client's answer.

#[tokio::test]
async fn roots_request_round_trips_through_the_client() {
    let h = reverse_harness().await;
    h.online_server_with_tools("srv-a", &["search"]).await;
    let bundle = h.session().await;

    // a forwarded call is in flight under the client's request id 17
    let entry = bundle
        .proxy
        .idmap()
        .register(&RequestId::Number(17), "srv-a", "tools/call");
    let routed = h.router.route(&entry.proxy_request_id).expect("routable");
    assert_eq!(routed.session_id(), bundle.client.session_id);

    let proxy = bundle.proxy.clone();
    let proxy_request_id = entry.proxy_request_id.clone();
    let pending =
        tokio::spawn(async move { proxy.forward_roots_list_to_client(&proxy_request_id).await });

    let frame = first_frame(&bundle.store).await;
    assert_eq!(frame["method"], "roots/list");
    assert_eq!(frame["params"]["_meta"]["relatedRequestId"], 17);
    let reverse_id = frame["id"].as_str().expect("string id").to_string();

    let response: ClientJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": reverse_id,
        "result": { "roots": [] },
    }))
    .unwrap();
    assert!(bundle.proxy.handle_message(response).await.is_none());

    let result = pending.await.unwrap().expect("client answered");
    assert!(result.roots.is_empty());
}

#[tokio::test]
async fn unanswered_reverse_request_times_out() {
    let h = reverse_harness().await;
    let bundle = h.session().await;
    let entry = bundle
        .proxy
        .idmap()
        .register(&RequestId::Number(1), "srv-a", "tools/call");

    let err = bundle
        .proxy
        .forward_roots_list_to_client(&entry.proxy_request_id)
        .await
        .err()
        .expect("must time out");
    assert!(err.message.contains("Reverse request timeout"));
    assert!(err.message.contains("roots/list"));
}

#[tokio::test]
async fn error_responses_propagate_to_the_waiting_server() {
    let h = reverse_harness().await;
    let bundle = h.session().await;
    let entry = bundle
        .proxy
        .idmap()
        .register(&RequestId::Number(2), "srv-a", "tools/call");

    let proxy = bundle.proxy.clone();
    let proxy_request_id = entry.proxy_request_id.clone();
    let pending =
        tokio::spawn(async move { proxy.forward_roots_list_to_client(&proxy_request_id).await });

    let frame = first_frame(&bundle.store).await;
    let reverse_id = frame["id"].as_str().unwrap().to_string();
    let response: ClientJsonRpcMessage = serde_json::from_value(json!({
        "jsonrpc": "2.0",
        "id": reverse_id,
        "error": { "code": -32600, "message": "roots unsupported" },
    }))
    .unwrap();
    bundle.proxy.handle_message(response).await;

    let err = pending.await.unwrap().err().expect("client rejected");
    assert_eq!(err.message, "roots unsupported");
}

#[tokio::test]
async fn unroutable_proxy_ids_find_no_session() {
    let h = reverse_harness().await;
    let _bundle = h.session().await;
    assert!(h.router.route("unknown-session:1:abc").is_none());
    assert!(h.router.route("").is_none());
}
