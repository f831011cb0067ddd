use std::time::Duration;

use mcpio::{
    model::{ErrorData, InitializeRequestParam, InitializeResult},
    service::{Router, RunningService, serve_client, serve_server},
};
use serde_json::json;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

pub type DuplexIo = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn duplex_pair() -> (DuplexIo, DuplexIo) {
    let (a, b) = tokio::io::duplex(4096);
    (tokio::io::split(a), tokio::io::split(b))
}

/// Router with the handlers the integration tests exercise:
/// `echo` returns its params, `slow` sleeps cooperatively, `stubborn` sleeps
/// without watching its cancellation token.
pub fn test_router() -> Router {
    Router::new()
        .request_handler("echo", |params, _ctx| async move {
            Ok(params.unwrap_or_default())
        })
        .request_handler("slow", |params, ctx| async move {
            let ms = params
                .as_ref()
                .and_then(|p| p.get("ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(100);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({"done": true})),
                _ = ctx.ct.cancelled() => Err(ErrorData::request_cancelled(None)),
            }
        })
        .request_handler("stubborn", |params, _ctx| async move {
            let ms = params
                .as_ref()
                .and_then(|p| p.get("ms"))
                .and_then(|v| v.as_u64())
                .unwrap_or(100);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"done": true}))
        })
}

/// Handshake a client and a server over an in-memory duplex pipe.
pub async fn start_pair(router: Router) -> (RunningService, RunningService) {
    init_tracing();
    let (client_io, server_io) = duplex_pair();
    let server_task = tokio::spawn(serve_server(
        router,
        server_io,
        InitializeResult::default(),
    ));
    let client = serve_client((), client_io, InitializeRequestParam::default())
        .await
        .expect("client handshake");
    let server = server_task
        .await
        .expect("server task")
        .expect("server handshake");
    (client, server)
}
