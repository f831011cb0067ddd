//! Server side of the streamable HTTP transport: one endpoint speaking
//! `POST` (client messages in), `GET` (standalone or resumed event streams)
//! and `DELETE` (explicit session teardown).

use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::any,
};
use futures::{Stream, StreamExt};
use http::{HeaderMap, Method, Request, StatusCode, header};

use crate::{
    model::{INITIALIZE_METHOD, InitializeResult, JsonRpcMessage},
    service::{Service, serve_server},
    transport::{
        auth::{TokenVerifier, bearer_token},
        common::{
            SessionId, accept_contains,
            http_header::{
                EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID,
                HEADER_X_ACCEL_BUFFERING, JSON_MIME_TYPE,
            },
        },
    },
};

pub mod session;
pub use session::{LocalSessionManager, ServerSseMessage, SessionConfig, SessionManager};

pub struct StreamableHttpServerConfig {
    /// Interval for comment keep-alive frames on idle streams; `None`
    /// disables them.
    pub sse_keep_alive: Option<Duration>,
    /// When set, every request must carry a bearer token this verifier
    /// accepts.
    pub token_verifier: Option<Arc<dyn TokenVerifier>>,
    /// `Origin` values accepted on incoming requests. `None` skips the
    /// check; an allowlist rejects browser-originated requests from other
    /// origins with 403, which blocks DNS rebinding against local servers.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            token_verifier: None,
            allowed_origins: None,
        }
    }
}

/// Serves one [`Service`] instance per HTTP session. Mount the [`Router`]
/// from [`StreamableHttpService::router`] wherever the endpoint should live.
pub struct StreamableHttpService<S, M = LocalSessionManager> {
    config: StreamableHttpServerConfig,
    session_manager: Arc<M>,
    service_factory: Arc<dyn Fn() -> S + Send + Sync>,
    server_info: InitializeResult,
}

type HandlerError = (StatusCode, String);

impl<S, M> StreamableHttpService<S, M>
where
    S: Service,
    M: SessionManager,
{
    pub fn new(
        service_factory: impl Fn() -> S + Send + Sync + 'static,
        session_manager: Arc<M>,
        server_info: InitializeResult,
        config: StreamableHttpServerConfig,
    ) -> Self {
        Self {
            config,
            session_manager,
            service_factory: Arc::new(service_factory),
            server_info,
        }
    }

    pub fn router(self) -> Router {
        Router::new()
            .route("/", any(handle))
            .with_state(Arc::new(self))
    }

    fn check_origin(&self, headers: &HeaderMap) -> Result<(), HandlerError> {
        let Some(allowed) = &self.config.allowed_origins else {
            return Ok(());
        };
        // Non-browser clients send no Origin header; the allowlist guards
        // against cross-origin browser requests only.
        let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        if allowed.iter().any(|entry| entry.eq_ignore_ascii_case(origin)) {
            Ok(())
        } else {
            Err((
                StatusCode::FORBIDDEN,
                format!("origin {origin} is not allowed"),
            ))
        }
    }

    async fn authorize(&self, headers: &HeaderMap) -> Result<(), HandlerError> {
        let Some(verifier) = &self.config.token_verifier else {
            return Ok(());
        };
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(bearer_token);
        let Some(token) = token else {
            return Err((StatusCode::UNAUTHORIZED, "missing bearer token".into()));
        };
        match verifier.verify(token).await {
            Some(access) if !access.is_expired() => Ok(()),
            _ => Err((StatusCode::UNAUTHORIZED, "invalid bearer token".into())),
        }
    }

    fn session_header(headers: &HeaderMap) -> Option<SessionId> {
        headers
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .map(SessionId::from)
    }

    fn sse_response<St>(&self, stream: St) -> Response
    where
        St: Stream<Item = ServerSseMessage> + Send + 'static,
    {
        let stream = stream.map(|message| {
            let mut event = Event::default().json_data(message.message.as_ref())?;
            if let Some(id) = message.event_id {
                event = event.id(id);
            }
            Ok::<_, axum::Error>(event)
        });
        // Applying keep_alive changes the Sse type parameter, so each arm
        // is converted to a Response before the match unifies.
        let mut response = match self.config.sse_keep_alive {
            Some(interval) => Sse::new(stream)
                .keep_alive(KeepAlive::default().interval(interval))
                .into_response(),
            None => Sse::new(stream).into_response(),
        };
        // Stops nginx-style proxies from buffering the event stream.
        response.headers_mut().insert(
            HEADER_X_ACCEL_BUFFERING,
            http::HeaderValue::from_static("no"),
        );
        response
    }

    async fn handle_post(
        &self,
        headers: &HeaderMap,
        message: JsonRpcMessage,
    ) -> Result<Response, HandlerError> {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !accept_contains(accept, JSON_MIME_TYPE) || !accept_contains(accept, EVENT_STREAM_MIME_TYPE)
        {
            return Err((
                StatusCode::NOT_ACCEPTABLE,
                format!("accept must include {JSON_MIME_TYPE} and {EVENT_STREAM_MIME_TYPE}"),
            ));
        }

        match Self::session_header(headers) {
            None => self.handle_initialize(message).await,
            Some(session_id) => {
                if !self
                    .session_manager
                    .has_session(&session_id)
                    .await
                    .map_err(internal_error)?
                {
                    return Err((StatusCode::NOT_FOUND, "session not found".into()));
                }
                match &message {
                    JsonRpcMessage::Request(_) => {
                        let stream = self
                            .session_manager
                            .create_stream(&session_id, message)
                            .await
                            .map_err(internal_error)?;
                        Ok(self.sse_response(stream))
                    }
                    _ => {
                        self.session_manager
                            .accept_message(&session_id, message)
                            .await
                            .map_err(internal_error)?;
                        Ok(StatusCode::ACCEPTED.into_response())
                    }
                }
            }
        }
    }

    /// First contact: no session header is only legal for `initialize`.
    async fn handle_initialize(&self, message: JsonRpcMessage) -> Result<Response, HandlerError> {
        let is_initialize = matches!(
            &message,
            JsonRpcMessage::Request(request) if request.method == INITIALIZE_METHOD
        );
        if !is_initialize {
            return Err((
                StatusCode::BAD_REQUEST,
                "expected initialize request when no session id is present".into(),
            ));
        }

        let (session_id, transport) = self
            .session_manager
            .create_session()
            .await
            .map_err(internal_error)?;
        let service = (self.service_factory)();
        let server_info = self.server_info.clone();
        {
            let session_id = session_id.clone();
            tokio::spawn(async move {
                match serve_server(service, transport, server_info).await {
                    Ok(running) => {
                        let _ = running.waiting().await;
                    }
                    Err(error) => {
                        tracing::error!(%session_id, %error, "session handshake failed");
                    }
                }
            });
        }

        let response = self
            .session_manager
            .initialize_session(&session_id, message)
            .await
            .map_err(internal_error)?;
        let mut http_response = Json(response).into_response();
        if let Ok(value) = session_id.parse() {
            http_response
                .headers_mut()
                .insert(HEADER_SESSION_ID, value);
        }
        Ok(http_response)
    }

    async fn handle_get(&self, headers: &HeaderMap) -> Result<Response, HandlerError> {
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !accept_contains(accept, EVENT_STREAM_MIME_TYPE) {
            return Err((
                StatusCode::NOT_ACCEPTABLE,
                format!("accept must include {EVENT_STREAM_MIME_TYPE}"),
            ));
        }
        let Some(session_id) = Self::session_header(headers) else {
            return Err((StatusCode::BAD_REQUEST, "missing session id".into()));
        };
        if !self
            .session_manager
            .has_session(&session_id)
            .await
            .map_err(internal_error)?
        {
            return Err((StatusCode::NOT_FOUND, "session not found".into()));
        }
        let last_event_id = headers
            .get(HEADER_LAST_EVENT_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        match last_event_id {
            Some(last_event_id) => {
                let stream = self
                    .session_manager
                    .resume(&session_id, last_event_id)
                    .await
                    .map_err(|error| (StatusCode::BAD_REQUEST, error.to_string()))?;
                Ok(self.sse_response(stream))
            }
            None => {
                let stream = self
                    .session_manager
                    .create_standalone_stream(&session_id)
                    .await
                    .map_err(internal_error)?;
                Ok(self.sse_response(stream))
            }
        }
    }

    async fn handle_delete(&self, headers: &HeaderMap) -> Result<Response, HandlerError> {
        let Some(session_id) = Self::session_header(headers) else {
            return Err((StatusCode::BAD_REQUEST, "missing session id".into()));
        };
        if !self
            .session_manager
            .has_session(&session_id)
            .await
            .map_err(internal_error)?
        {
            return Err((StatusCode::NOT_FOUND, "session not found".into()));
        }
        self.session_manager
            .close_session(&session_id)
            .await
            .map_err(internal_error)?;
        tracing::info!(%session_id, "session deleted");
        Ok(StatusCode::OK.into_response())
    }
}

fn internal_error<E: std::error::Error>(error: E) -> HandlerError {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

async fn handle<S, M>(
    State(service): State<Arc<StreamableHttpService<S, M>>>,
    request: Request<Body>,
) -> Response
where
    S: Service,
    M: SessionManager,
{
    let (parts, body) = request.into_parts();
    if let Err((status, message)) = service.check_origin(&parts.headers) {
        return (status, message).into_response();
    }
    if let Err((status, message)) = service.authorize(&parts.headers).await {
        return (status, message).into_response();
    }
    let result = match parts.method {
        Method::POST => {
            let content_type = parts
                .headers
                .get(header::CONTENT_TYPE)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default();
            if !content_type.starts_with(JSON_MIME_TYPE) {
                return (
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    format!("content-type must be {JSON_MIME_TYPE}"),
                )
                    .into_response();
            }
            let bytes = match axum::body::to_bytes(body, 4 * 1024 * 1024).await {
                Ok(bytes) => bytes,
                Err(error) => {
                    return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
                }
            };
            let message: JsonRpcMessage = match serde_json::from_slice(&bytes) {
                Ok(message) => message,
                Err(error) => {
                    return (
                        StatusCode::BAD_REQUEST,
                        format!("malformed json-rpc message: {error}"),
                    )
                        .into_response();
                }
            };
            service.handle_post(&parts.headers, message).await
        }
        Method::GET => service.handle_get(&parts.headers).await,
        Method::DELETE => service.handle_delete(&parts.headers).await,
        _ => Err((
            StatusCode::METHOD_NOT_ALLOWED,
            "only POST, GET and DELETE are supported".into(),
        )),
    };
    match result {
        Ok(response) => response,
        Err((status, message)) => (status, message).into_response(),
    }
}
