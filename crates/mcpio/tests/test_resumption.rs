mod common;

use std::time::Duration;

use common::test_router;
use futures::StreamExt;
use mcpio::{
    model::{InitializeRequestParam, InitializeResult, JsonRpcMessage, RequestId},
    service::{RunningService, serve_server},
    transport::streamable_http_server::session::{
        LocalSessionManager, SessionConfig, SessionManager,
    },
};
use serde_json::json;

async fn open_session(
    manager: &LocalSessionManager,
) -> (mcpio::transport::common::SessionId, RunningService) {
    let (session_id, transport) = manager.create_session().await.unwrap();
    let server_task = tokio::spawn(serve_server(
        test_router(),
        transport,
        InitializeResult::default(),
    ));

    let init = JsonRpcMessage::request(
        RequestId::Number(0),
        "initialize",
        Some(serde_json::to_value(InitializeRequestParam::default()).unwrap()),
    );
    let response = manager
        .initialize_session(&session_id, init)
        .await
        .unwrap();
    assert!(matches!(response, JsonRpcMessage::Response(_)));
    manager
        .accept_message(
            &session_id,
            JsonRpcMessage::notification("notifications/initialized", None),
        )
        .await
        .unwrap();

    let running = server_task.await.unwrap().unwrap();
    (session_id, running)
}

async fn next_event_id<S>(stream: &mut S) -> String
where
    S: futures::Stream<
            Item = mcpio::transport::streamable_http_server::session::ServerSseMessage,
        > + Unpin,
{
    let event = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("timed out waiting for event")
        .expect("stream ended");
    event.event_id.expect("event id")
}

#[tokio::test]
async fn resume_replays_missed_events_in_order() {
    let manager = LocalSessionManager::default();
    let (session_id, running) = open_session(&manager).await;

    // no stream attached yet: everything lands in the log
    for i in 0..10 {
        running
            .peer()
            .send_notification("notifications/event", Some(json!({"i": i})))
            .await
            .unwrap();
    }
    // give the routing worker time to log them
    tokio::time::sleep(Duration::from_millis(50)).await;

    // client saw events up to 0/5 before disconnecting
    let mut resumed = manager.resume(&session_id, "0/5".into()).await.unwrap();
    for expected in 6..10 {
        let event_id = next_event_id(&mut resumed).await;
        assert_eq!(event_id, format!("0/{expected}"));
    }

    // the resumed stream keeps tailing live events
    running
        .peer()
        .send_notification("notifications/event", Some(json!({"i": 10})))
        .await
        .unwrap();
    let event_id = next_event_id(&mut resumed).await;
    assert_eq!(event_id, "0/10");

    running.cancel().await.unwrap();
}

#[tokio::test]
async fn resume_from_evicted_position_fails() {
    let manager = LocalSessionManager::new(SessionConfig {
        event_retention: 4,
        ..SessionConfig::default()
    });
    let (session_id, running) = open_session(&manager).await;

    for i in 0..10 {
        running
            .peer()
            .send_notification("notifications/event", Some(json!({"i": i})))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // only 6..=9 are retained; resuming from 0/1 would skip 2..=5
    let result = manager.resume(&session_id, "0/1".into()).await;
    assert!(result.is_err(), "expected eviction error");

    // resuming inside the retained window still works
    let mut resumed = manager.resume(&session_id, "0/7".into()).await.unwrap();
    assert_eq!(next_event_id(&mut resumed).await, "0/8");
    assert_eq!(next_event_id(&mut resumed).await, "0/9");

    running.cancel().await.unwrap();
}

#[tokio::test]
async fn resume_past_newest_event_is_rejected() {
    let manager = LocalSessionManager::default();
    let (session_id, running) = open_session(&manager).await;

    for i in 0..3 {
        running
            .peer()
            .send_notification("notifications/event", Some(json!({"i": i})))
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // 0/2 is the newest event this session ever sent; a client cannot
    // legitimately claim to have seen 0/9
    assert!(manager.resume(&session_id, "0/9".into()).await.is_err());

    // the newest real event still resumes and keeps tailing
    let mut resumed = manager.resume(&session_id, "0/2".into()).await.unwrap();
    running
        .peer()
        .send_notification("notifications/event", Some(json!({"i": 3})))
        .await
        .unwrap();
    assert_eq!(next_event_id(&mut resumed).await, "0/3");

    running.cancel().await.unwrap();
}

#[tokio::test]
async fn idle_session_is_reaped() {
    let manager = LocalSessionManager::new(SessionConfig {
        idle_timeout: Some(Duration::from_millis(200)),
        ..SessionConfig::default()
    });
    let (session_id, running) = open_session(&manager).await;
    assert!(manager.has_session(&session_id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert!(!manager.has_session(&session_id).await.unwrap());
    assert!(
        manager
            .accept_message(
                &session_id,
                JsonRpcMessage::notification("notifications/event", None),
            )
            .await
            .is_err()
    );

    let _ = running.waiting().await;
}

#[tokio::test]
async fn malformed_event_id_is_rejected() {
    let manager = LocalSessionManager::default();
    let (session_id, running) = open_session(&manager).await;

    assert!(manager.resume(&session_id, "nonsense".into()).await.is_err());
    assert!(manager.resume(&session_id, "7/0".into()).await.is_err());

    running.cancel().await.unwrap();
}

#[tokio::test]
async fn closed_session_is_gone() {
    let manager = LocalSessionManager::default();
    let (session_id, running) = open_session(&manager).await;

    assert!(manager.has_session(&session_id).await.unwrap());
    manager.close_session(&session_id).await.unwrap();
    assert!(!manager.has_session(&session_id).await.unwrap());
    assert!(
        manager
            .accept_message(
                &session_id,
                JsonRpcMessage::notification("notifications/event", None),
            )
            .await
            .is_err()
    );

    let _ = running.waiting().await;
}
