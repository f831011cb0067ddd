mod common;

use std::time::Duration;

use common::test_router;
use mcpio::{
    model::{InitializeRequestParam, InitializeResult},
    service::serve_client,
    transport::{SseClientTransport, SseServer, SseServerConfig},
};
use serde_json::json;
use tokio_util::sync::CancellationToken;

async fn spawn_sse_server(
    allowed_origins: Option<Vec<String>>,
) -> (std::net::SocketAddr, CancellationToken) {
    let config = SseServerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: CancellationToken::new(),
        sse_keep_alive: Some(Duration::from_secs(5)),
        allowed_origins,
    };
    let (server, router) = SseServer::new(config);
    let listener = tokio::net::TcpListener::bind(server.config.bind).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = server.config.ct.clone();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
        });
    }
    let ct = server.with_service(InitializeResult::default(), test_router);
    (addr, ct)
}

#[tokio::test]
async fn full_session_over_sse() {
    let (addr, ct) = spawn_sse_server(None).await;
    let transport = SseClientTransport::start(format!("http://{addr}/sse")).unwrap();
    let running = serve_client((), transport, InitializeRequestParam::default())
        .await
        .expect("handshake over sse");

    let pong = running.peer().send_request("ping", None).await.unwrap();
    assert_eq!(pong, json!({}));

    let params = json!({"text": "over sse"});
    let echoed = running
        .peer()
        .send_request("echo", Some(params.clone()))
        .await
        .unwrap();
    assert_eq!(echoed, params);

    running.cancel().await.unwrap();
    ct.cancel();
}

#[tokio::test]
async fn two_independent_sse_sessions() {
    let (addr, ct) = spawn_sse_server(None).await;
    let mut sessions = Vec::new();
    for i in 0..2u64 {
        let transport = SseClientTransport::start(format!("http://{addr}/sse")).unwrap();
        let running = serve_client((), transport, InitializeRequestParam::default())
            .await
            .unwrap();
        let echoed = running
            .peer()
            .send_request("echo", Some(json!({"session": i})))
            .await
            .unwrap();
        assert_eq!(echoed, json!({"session": i}));
        sessions.push(running);
    }
    for running in sessions {
        running.cancel().await.unwrap();
    }
    ct.cancel();
}

#[tokio::test]
async fn cross_origin_request_is_forbidden() {
    let (addr, ct) = spawn_sse_server(Some(vec!["http://localhost:8080".to_string()])).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{addr}/sse"))
        .header("origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let response = client
        .post(format!("http://{addr}/message?sessionId=whatever"))
        .header("origin", "http://evil.example")
        .json(&mcpio::model::JsonRpcMessage::notification(
            "notifications/initialized",
            None,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    // the allowed origin still opens a stream
    let response = client
        .get(format!("http://{addr}/sse"))
        .header("origin", "http://localhost:8080")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    ct.cancel();
}
