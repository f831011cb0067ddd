mod common;

use std::sync::Arc;

use common::test_router;
use mcpio::{
    model::{InitializeRequestParam, InitializeResult},
    service::serve_client,
    transport::{
        StreamableHttpClientTransport, StreamableHttpServerConfig, StreamableHttpService,
        streamable_http_server::session::LocalSessionManager,
    },
};
use serde_json::json;

async fn spawn_server_with_config(config: StreamableHttpServerConfig) -> std::net::SocketAddr {
    let service = StreamableHttpService::new(
        test_router,
        Arc::new(LocalSessionManager::default()),
        InitializeResult::default(),
        config,
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, service.router()).await;
    });
    addr
}

async fn spawn_server() -> std::net::SocketAddr {
    spawn_server_with_config(StreamableHttpServerConfig::default()).await
}

#[tokio::test]
async fn full_session_over_streamable_http() {
    let addr = spawn_server().await;
    let transport = StreamableHttpClientTransport::start(format!("http://{addr}/"));
    let running = serve_client((), transport, InitializeRequestParam::default())
        .await
        .expect("handshake over http");

    let pong = running.peer().send_request("ping", None).await.unwrap();
    assert_eq!(pong, json!({}));

    let params = json!({"payload": [1, 2, 3]});
    let echoed = running
        .peer()
        .send_request("echo", Some(params.clone()))
        .await
        .unwrap();
    assert_eq!(echoed, params);

    running.cancel().await.unwrap();
}

#[tokio::test]
async fn concurrent_requests_over_streamable_http() {
    let addr = spawn_server().await;
    let transport = StreamableHttpClientTransport::start(format!("http://{addr}/"));
    let running = serve_client((), transport, InitializeRequestParam::default())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..8u64 {
        let peer = running.peer().clone();
        handles.push(tokio::spawn(async move {
            peer.send_request("echo", Some(json!({"i": i}))).await
        }));
    }
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.unwrap().unwrap(), json!({"i": i as u64}));
    }
    running.cancel().await.unwrap();
}

#[tokio::test]
async fn post_without_initialize_or_session_is_rejected() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/"))
        .header("accept", "application/json, text/event-stream")
        .json(&mcpio::JsonRpcMessage::notification(
            "notifications/initialized",
            None,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn post_with_unknown_session_is_not_found() {
    let addr = spawn_server().await;
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/"))
        .header("accept", "application/json, text/event-stream")
        .header("Mcp-Session-Id", "does-not-exist")
        .json(&mcpio::JsonRpcMessage::request(
            mcpio::RequestId::Number(1),
            "ping",
            None,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn session_works_without_keep_alive_frames() {
    let addr = spawn_server_with_config(StreamableHttpServerConfig {
        sse_keep_alive: None,
        ..StreamableHttpServerConfig::default()
    })
    .await;
    let transport = StreamableHttpClientTransport::start(format!("http://{addr}/"));
    let running = serve_client((), transport, InitializeRequestParam::default())
        .await
        .unwrap();
    let pong = running.peer().send_request("ping", None).await.unwrap();
    assert_eq!(pong, json!({}));
    running.cancel().await.unwrap();
}

#[tokio::test]
async fn cross_origin_initialize_is_forbidden() {
    let addr = spawn_server_with_config(StreamableHttpServerConfig {
        allowed_origins: Some(vec!["http://localhost:3000".to_string()]),
        ..StreamableHttpServerConfig::default()
    })
    .await;
    let client = reqwest::Client::new();
    let init = mcpio::JsonRpcMessage::request(
        mcpio::RequestId::Number(0),
        "initialize",
        Some(serde_json::to_value(InitializeRequestParam::default()).unwrap()),
    );

    let response = client
        .post(format!("http://{addr}/"))
        .header("accept", "application/json, text/event-stream")
        .header("origin", "http://evil.example")
        .json(&init)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(response.headers().get("Mcp-Session-Id").is_none());

    // the allowed origin completes the handshake
    let response = client
        .post(format!("http://{addr}/"))
        .header("accept", "application/json, text/event-stream")
        .header("origin", "http://localhost:3000")
        .json(&init)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert!(response.headers().get("Mcp-Session-Id").is_some());
}
