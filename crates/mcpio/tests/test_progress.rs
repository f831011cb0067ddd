mod common;

use std::sync::{Arc, Mutex};

use common::start_pair;
use mcpio::{
    model::{ProgressNotificationParam, ProgressToken},
    service::{RequestOptions, Router},
};
use serde_json::json;

fn progressive_router() -> Router {
    Router::new().request_handler("progressive", |params, ctx| async move {
        let token = params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|meta| meta.get("progressToken"))
            .cloned();
        if let Some(token) = token {
            let token: ProgressToken =
                serde_json::from_value(token).map_err(|e| {
                    mcpio::model::ErrorData::invalid_params(e.to_string(), None)
                })?;
            for step in 1..=3u32 {
                let _ = ctx
                    .peer
                    .notify_progress(ProgressNotificationParam {
                        progress_token: token.clone(),
                        progress: f64::from(step),
                        total: Some(3.0),
                        message: Some(format!("step {step}")),
                    })
                    .await;
            }
        }
        Ok(json!({"done": true}))
    })
}

#[tokio::test]
async fn progress_notifications_reach_the_callback() {
    let (client, _server) = start_pair(progressive_router()).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let result = client
        .peer()
        .send_request_with(
            "progressive",
            Some(json!({})),
            RequestOptions {
                timeout: None,
                on_progress: Some(Arc::new(move |params| {
                    sink.lock().unwrap().push(params.progress);
                })),
            },
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"done": true}));

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![1.0, 2.0, 3.0]);
    client.cancel().await.unwrap();
}

/// Progress for a token nobody is waiting on is dropped quietly.
#[tokio::test]
async fn progress_without_callback_is_ignored() {
    let (client, _server) = start_pair(progressive_router()).await;
    let result = client
        .peer()
        .send_request("progressive", Some(json!({})))
        .await
        .unwrap();
    assert_eq!(result, json!({"done": true}));
    client.cancel().await.unwrap();
}
