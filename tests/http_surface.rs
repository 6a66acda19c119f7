mod common;

use mcp_switchboard::config::default_settings;
use mcp_switchboard::http::{start_http_server, AppState};
use serde_json::json;

async fn serve(h: &common::Harness) -> String {
    let state = AppState {
        sessions: h.sessions.clone(),
        verifier: h.store.clone(),
        settings: default_settings(),
    };
    let (_handle, addr) = start_http_server(state, "127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    format!("http://{addr}/mcp")
}

fn initialize_body() -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": { "name": "it-client", "version": "0.0.1" }
        }
    })
}

#[tokio::test]
async fn initialize_creates_a_session_and_advertises_capabilities() {
    let h = common::harness().await;
    let url = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let session_id = res
        .headers()
        .get("mcp-session-id")
        .expect("session header")
        .to_str()
        .unwrap()
        .to_string();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["result"]["serverInfo"]["name"], "mcp-switchboard");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], true);
    assert_eq!(body["result"]["capabilities"]["resources"]["subscribe"], true);

    // the session is queryable afterwards
    assert!(h.sessions.get(&session_id).await.is_some());

    // list tools over the same session
    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .header("Mcp-Session-Id", &session_id)
        .json(&json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["result"]["tools"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn missing_token_and_bad_session_are_rejected() {
    let h = common::harness().await;
    let url = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client
        .post(&url)
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    let challenge = res
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.contains("invalid_token"));
    assert!(challenge.contains("oauth-protected-resource"));

    // non-initialize request without a session
    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .json(&json!({ "jsonrpc": "2.0", "id": 5, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 400);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);

    // unknown session id
    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .header("Mcp-Session-Id", "nope")
        .json(&json!({ "jsonrpc": "2.0", "id": 6, "method": "tools/list" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}

#[tokio::test]
async fn unsupported_methods_follow_the_contract() {
    let h = common::harness().await;
    let url = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client.put(&url).bearer_auth("tok-1").send().await.unwrap();
    assert_eq!(res.status(), 405);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32000);

    let res = client.patch(&url).bearer_auth("tok-1").send().await.unwrap();
    assert_eq!(res.status(), 405);

    let res = client.head(&url).send().await.unwrap();
    assert_eq!(res.status(), 401);
    assert!(res.headers().get("www-authenticate").is_some());

    let res = client.head(&url).bearer_auth("tok-1").send().await.unwrap();
    assert_eq!(res.status(), 405);

    let res = client
        .request(reqwest::Method::OPTIONS, &url)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
    assert_eq!(
        res.headers()
            .get("access-control-allow-origin")
            .unwrap()
            .to_str()
            .unwrap(),
        "*"
    );
}

#[tokio::test]
async fn stream_resume_replays_only_missed_events() {
    let h = common::harness().await;
    let url = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    let session_id = res
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let bundle = h.sessions.get(&session_id).await.unwrap();
    for n in 1..=3u64 {
        bundle
            .store
            .append(json!({ "jsonrpc": "2.0", "method": "notifications/message", "params": { "n": n } }));
    }

    let res = client
        .get(&url)
        .bearer_auth("tok-1")
        .header("Mcp-Session-Id", &session_id)
        .header("Last-Event-Id", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
    let mut res = res;
    let chunk = res.chunk().await.unwrap().expect("replay chunk");
    let text = String::from_utf8_lossy(&chunk).to_string();
    assert!(text.contains("id: 2"), "got: {text}");
    assert!(!text.contains("id: 1\n"), "event 1 must not replay: {text}");
}

#[tokio::test]
async fn delete_terminates_the_session() {
    let h = common::harness().await;
    let url = serve(&h).await;
    let client = reqwest::Client::new();

    let res = client
        .post(&url)
        .bearer_auth("tok-1")
        .json(&initialize_body())
        .send()
        .await
        .unwrap();
    let session_id = res
        .headers()
        .get("mcp-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let res = client
        .delete(&url)
        .bearer_auth("tok-1")
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 204);
    assert!(h.sessions.get(&session_id).await.is_none());

    let res = client
        .delete(&url)
        .bearer_auth("tok-1")
        .header("Mcp-Session-Id", &session_id)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 404);
}
