mod common;

use common::{start_pair, test_router};
use mcpio::service::Router;
use serde_json::json;

/// Handlers finish in reverse submission order, so responses come back
/// out of order and only id correlation can pair them up.
#[tokio::test]
async fn concurrent_requests_resolve_out_of_order() {
    let router = Router::new().request_handler("tagged", |params, _ctx| async move {
        let params = params.unwrap_or_default();
        let tag = params.get("tag").and_then(|v| v.as_u64()).unwrap_or(0);
        tokio::time::sleep(std::time::Duration::from_millis(80 - tag * 5)).await;
        Ok(json!({"tag": tag}))
    });
    let (client, _server) = start_pair(router).await;

    let mut handles = Vec::new();
    for tag in 0..16u64 {
        let peer = client.peer().clone();
        handles.push(tokio::spawn(async move {
            peer.send_request("tagged", Some(json!({"tag": tag}))).await
        }));
    }
    for (tag, handle) in handles.into_iter().enumerate() {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result, json!({"tag": tag as u64}));
    }
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn interleaved_bidirectional_requests() {
    let (client, server) = start_pair(test_router()).await;

    // both directions in flight at once
    let client_peer = client.peer().clone();
    let client_call = tokio::spawn(async move {
        client_peer
            .send_request("echo", Some(json!({"from": "client"})))
            .await
    });
    let server_call = server.peer().send_request("ping", None).await.unwrap();
    assert_eq!(server_call, json!({}));
    assert_eq!(
        client_call.await.unwrap().unwrap(),
        json!({"from": "client"})
    );
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn notifications_do_not_disturb_pending_requests() {
    let (client, _server) = start_pair(test_router()).await;

    let peer = client.peer().clone();
    let pending = tokio::spawn(async move {
        peer.send_request("slow", Some(json!({"ms": 60}))).await
    });
    for i in 0..5 {
        client
            .peer()
            .send_notification("notifications/test", Some(json!({"i": i})))
            .await
            .unwrap();
    }
    assert_eq!(pending.await.unwrap().unwrap(), json!({"done": true}));
    client.cancel().await.unwrap();
}
