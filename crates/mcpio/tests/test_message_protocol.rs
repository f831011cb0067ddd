mod common;

use common::{duplex_pair, start_pair, test_router};
use mcpio::{
    model::{InitializeRequestParam, InitializeResult, ProtocolVersion},
    service::{ClientInitializeError, serve_client, serve_server},
};
use serde_json::json;

#[tokio::test]
async fn ping_round_trip() {
    let (client, server) = start_pair(test_router()).await;
    let pong = client.peer().send_request("ping", None).await.unwrap();
    assert_eq!(pong, json!({}));

    // ping works in both directions
    let pong = server.peer().send_request("ping", None).await.unwrap();
    assert_eq!(pong, json!({}));

    client.cancel().await.unwrap();
}

#[tokio::test]
async fn echo_round_trip() {
    let (client, _server) = start_pair(test_router()).await;
    let params = json!({"text": "hello", "n": 42});
    let result = client
        .peer()
        .send_request("echo", Some(params.clone()))
        .await
        .unwrap();
    assert_eq!(result, params);
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let (client, _server) = start_pair(test_router()).await;
    let error = client
        .peer()
        .send_request("no/such/method", None)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("method not found"), "{error}");
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn handshake_exposes_peer_info() {
    let (client, server) = start_pair(test_router()).await;
    assert!(format!("{client:?}").starts_with("RunningService"));
    let client_view = client.peer().peer_info().expect("server info");
    assert_eq!(client_view.protocol_version(), &ProtocolVersion::LATEST);
    let server_view = server.peer().peer_info().expect("client info");
    assert_eq!(server_view.protocol_version(), &ProtocolVersion::LATEST);
    client.cancel().await.unwrap();
}

#[tokio::test]
async fn version_mismatch_fails_initialize() {
    let (client_io, server_io) = duplex_pair();
    let server_task = tokio::spawn(serve_server(
        test_router(),
        server_io,
        InitializeResult::default(),
    ));
    let info = InitializeRequestParam {
        protocol_version: ProtocolVersion::from("1999-12-31".to_string()),
        ..Default::default()
    };
    let error = serve_client((), client_io, info).await.unwrap_err();
    assert!(
        matches!(error, ClientInitializeError::InitializeFailed(_)),
        "{error:?}"
    );
    assert!(server_task.await.unwrap().is_err());
}
