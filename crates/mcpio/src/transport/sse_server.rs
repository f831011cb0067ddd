//! Server side of the HTTP+SSE transport.
//!
//! Each `GET` on the SSE path opens a session: the first event on the stream
//! is an `endpoint` event telling the client where to `POST`, every later
//! event carries one JSON-RPC message. Clients send by `POST`ing to that
//! endpoint with their `sessionId` query parameter.

use std::{collections::HashMap, io, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    model::{InitializeResult, JsonRpcMessage},
    service::{RunningService, ServerInitializeError, Service, serve_server},
    transport::{
        Transport,
        common::{SessionId, session_id},
    },
};

type SessionTxs = Arc<std::sync::RwLock<HashMap<SessionId, mpsc::Sender<JsonRpcMessage>>>>;

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SseServerConfig {
    pub bind: SocketAddr,
    pub sse_path: String,
    pub post_path: String,
    pub ct: CancellationToken,
    /// Interval for comment keep-alive frames on idle streams; `None`
    /// disables them.
    pub sse_keep_alive: Option<Duration>,
    /// `Origin` values accepted on incoming requests. `None` skips the
    /// check; an allowlist rejects browser-originated requests from other
    /// origins with 403, which blocks DNS rebinding against local servers.
    pub allowed_origins: Option<Vec<String>>,
}

#[derive(Clone)]
struct App {
    txs: SessionTxs,
    transport_tx: mpsc::Sender<SseServerTransport>,
    post_path: Arc<str>,
    sse_keep_alive: Option<Duration>,
    allowed_origins: Option<Arc<[String]>>,
}

fn origin_allowed(allowed: Option<&[String]>, headers: &HeaderMap) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    // Non-browser clients send no Origin header; the allowlist guards
    // against cross-origin browser requests only.
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    allowed.iter().any(|entry| entry.eq_ignore_ascii_case(origin))
}

#[derive(Deserialize)]
struct PostEventQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Removes the session's inbound channel once the SSE response stream is
/// dropped, so later `POST`s get a 404 instead of feeding a dead session.
struct SessionCleanup {
    txs: SessionTxs,
    session_id: SessionId,
}

impl Drop for SessionCleanup {
    fn drop(&mut self) {
        tracing::debug!(session_id = %self.session_id, "sse connection closed");
        let mut txs = self
            .txs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        txs.remove(&self.session_id);
    }
}

async fn sse_handler(
    State(app): State<App>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    if !origin_allowed(app.allowed_origins.as_deref(), &headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    let session_id = session_id();
    tracing::info!(%session_id, "new sse connection");

    let (from_client_tx, from_client_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    let (to_client_tx, to_client_rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
    {
        let mut txs = app
            .txs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        txs.insert(session_id.clone(), from_client_tx);
    }
    let cleanup = SessionCleanup {
        txs: app.txs.clone(),
        session_id: session_id.clone(),
    };

    let transport = SseServerTransport {
        session_id: session_id.clone(),
        to_client: to_client_tx,
        from_client: from_client_rx,
        closed: false,
    };
    if app.transport_tx.send(transport).await.is_err() {
        tracing::warn!("sse server is no longer accepting transports");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let endpoint = format!("{}?sessionId={}", app.post_path, session_id);
    let mut to_client_rx = to_client_rx;
    let stream = async_stream::stream! {
        // Moving the guard in ties the session's lifetime to this stream.
        let _cleanup = cleanup;
        yield Ok::<_, axum::Error>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = to_client_rx.recv().await {
            yield Event::default().json_data(&message);
        }
    };

    // Applying keep_alive changes the Sse type parameter, so each arm is
    // converted to a Response before the match unifies.
    let response = match app.sse_keep_alive {
        Some(interval) => Sse::new(stream)
            .keep_alive(KeepAlive::default().interval(interval))
            .into_response(),
        None => Sse::new(stream).into_response(),
    };
    Ok(response)
}

async fn post_event_handler(
    State(app): State<App>,
    Query(PostEventQuery { session_id }): Query<PostEventQuery>,
    headers: HeaderMap,
    Json(message): Json<JsonRpcMessage>,
) -> Result<StatusCode, StatusCode> {
    if !origin_allowed(app.allowed_origins.as_deref(), &headers) {
        return Err(StatusCode::FORBIDDEN);
    }
    tracing::debug!(%session_id, ?message, "inbound sse post");
    let tx = {
        let txs = app
            .txs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        txs.get(session_id.as_str()).cloned()
    };
    let Some(tx) = tx else {
        return Err(StatusCode::NOT_FOUND);
    };
    if tx.send(message).await.is_err() {
        // Session task went away but the stream has not been reaped yet.
        return Err(StatusCode::GONE);
    }
    Ok(StatusCode::ACCEPTED)
}

/// Server half of one SSE session.
pub struct SseServerTransport {
    session_id: SessionId,
    to_client: mpsc::Sender<JsonRpcMessage>,
    from_client: mpsc::Receiver<JsonRpcMessage>,
    closed: bool,
}

impl SseServerTransport {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}

impl Transport for SseServerTransport {
    type Error = io::Error;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "session closed"));
        }
        self.to_client
            .send(item)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client disconnected"))
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        if self.closed {
            return None;
        }
        self.from_client.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.closed = true;
        self.from_client.close();
        Ok(())
    }
}

pub struct SseServer {
    transport_rx: mpsc::Receiver<SseServerTransport>,
    pub config: SseServerConfig,
}

impl SseServer {
    /// Bind and serve with default paths (`/sse` and `/message`).
    pub async fn serve(bind: SocketAddr) -> io::Result<Self> {
        Self::serve_with_config(SseServerConfig {
            bind,
            sse_path: "/sse".to_string(),
            post_path: "/message".to_string(),
            ct: CancellationToken::new(),
            sse_keep_alive: Some(Duration::from_secs(15)),
            allowed_origins: None,
        })
        .await
    }

    pub async fn serve_with_config(config: SseServerConfig) -> io::Result<Self> {
        let (server, router) = Self::new(config);
        let listener = tokio::net::TcpListener::bind(server.config.bind).await?;
        let ct = server.config.ct.child_token();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move { ct.cancelled().await });
            if let Err(error) = serve.await {
                tracing::error!(%error, "sse server shut down with error");
            }
        });
        Ok(server)
    }

    /// Build the server and its router without binding, for mounting into an
    /// existing axum application.
    pub fn new(config: SseServerConfig) -> (Self, Router) {
        let (transport_tx, transport_rx) = mpsc::channel(16);
        let app = App {
            txs: Default::default(),
            transport_tx,
            post_path: config.post_path.as_str().into(),
            sse_keep_alive: config.sse_keep_alive,
            allowed_origins: config.allowed_origins.clone().map(Arc::from),
        };
        let router = Router::new()
            .route(&config.sse_path, get(sse_handler))
            .route(&config.post_path, post(post_event_handler))
            .with_state(app);
        (
            Self {
                transport_rx,
                config,
            },
            router,
        )
    }

    /// Accept the next incoming session's transport. `None` once the server
    /// has shut down.
    pub async fn next_transport(&mut self) -> Option<SseServerTransport> {
        self.transport_rx.recv().await
    }

    /// Run a service instance per incoming session until cancelled.
    pub fn with_service<S, F>(mut self, info: InitializeResult, service_factory: F) -> CancellationToken
    where
        S: Service,
        F: Fn() -> S + Send + 'static,
    {
        let ct = self.config.ct.clone();
        tokio::spawn(async move {
            while let Some(transport) = self.next_transport().await {
                let session_id = transport.session_id().clone();
                let service = service_factory();
                let info = info.clone();
                tokio::spawn(async move {
                    let running: Result<RunningService, ServerInitializeError> =
                        serve_server(service, transport, info).await;
                    match running {
                        Ok(running) => {
                            let _ = running.waiting().await;
                        }
                        Err(error) => {
                            tracing::error!(%session_id, %error, "session handshake failed");
                        }
                    }
                });
            }
        });
        ct
    }

    pub fn cancel(&self) {
        self.config.ct.cancel();
    }
}
