//! Client side of the streamable HTTP transport: every outbound message is a
//! `POST` to one endpoint; the server answers with a plain JSON body, a
//! request-scoped SSE stream, or 202 Accepted, and may offer a standalone
//! `GET` stream for server-initiated messages.

use std::{borrow::Cow, sync::Arc};

use futures::StreamExt;
use sse_stream::SseStream;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    model::JsonRpcMessage,
    transport::{
        Transport,
        common::{
            SessionId,
            http_header::{
                EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID, JSON_MIME_TYPE,
            },
            sse::{BoxedSseResponse, SseRetryConfig},
        },
        worker::{Worker, WorkerConfig, WorkerContext, WorkerQuitReason, WorkerSendRequest, WorkerTransport},
    },
};

#[derive(Debug, Error)]
pub enum StreamableHttpError<E: std::error::Error + Send + Sync + 'static> {
    #[error("client error: {0}")]
    Client(E),
    #[error("unexpected server response: {0}")]
    UnexpectedServerResponse(Cow<'static, str>),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("server does not support sse")]
    ServerDoesNotSupportSse,
    #[error("server does not support session deletion")]
    ServerDoesNotSupportDeleteSession,
    #[error("transport channel closed")]
    TransportChannelClosed,
    #[error("deserialize error: {0}")]
    Deserialize(#[from] serde_json::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What came back from a `POST`.
pub enum StreamableHttpPostResponse {
    /// 202, nothing to read. The usual reply to notifications and responses.
    Accepted,
    /// Immediate JSON body, plus the session id on initialize.
    Json(JsonRpcMessage, Option<String>),
    /// Request-scoped event stream.
    Sse(BoxedSseResponse, Option<String>),
}

impl std::fmt::Debug for StreamableHttpPostResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accepted => f.write_str("Accepted"),
            Self::Json(message, session) => {
                f.debug_tuple("Json").field(message).field(session).finish()
            }
            Self::Sse(_, session) => f.debug_tuple("Sse").field(session).finish(),
        }
    }
}

pub trait StreamableHttpClient: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn post_message(
        &self,
        uri: Arc<str>,
        message: JsonRpcMessage,
        session_id: Option<SessionId>,
    ) -> impl Future<Output = Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>>> + Send;

    fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: SessionId,
    ) -> impl Future<Output = Result<(), StreamableHttpError<Self::Error>>> + Send;

    fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: SessionId,
        last_event_id: Option<String>,
    ) -> impl Future<Output = Result<BoxedSseResponse, StreamableHttpError<Self::Error>>> + Send;
}

impl StreamableHttpClient for reqwest::Client {
    type Error = reqwest::Error;

    async fn post_message(
        &self,
        uri: Arc<str>,
        message: JsonRpcMessage,
        session_id: Option<SessionId>,
    ) -> Result<StreamableHttpPostResponse, StreamableHttpError<Self::Error>> {
        let mut request = self.post(uri.as_ref()).header(
            reqwest::header::ACCEPT,
            [JSON_MIME_TYPE, EVENT_STREAM_MIME_TYPE].join(", "),
        );
        if let Some(session_id) = session_id {
            request = request.header(HEADER_SESSION_ID, session_id.as_ref());
        }
        let response = request
            .json(&message)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(StreamableHttpError::Client)?;

        if response.status() == reqwest::StatusCode::ACCEPTED {
            return Ok(StreamableHttpPostResponse::Accepted);
        }
        let session_id = response
            .headers()
            .get(HEADER_SESSION_ID)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        match content_type {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {
                let stream = SseStream::from_bytes_stream(response.bytes_stream()).boxed();
                Ok(StreamableHttpPostResponse::Sse(stream, session_id))
            }
            Some(ct) if ct.starts_with(JSON_MIME_TYPE) => {
                let message = response
                    .json::<JsonRpcMessage>()
                    .await
                    .map_err(StreamableHttpError::Client)?;
                Ok(StreamableHttpPostResponse::Json(message, session_id))
            }
            other => Err(StreamableHttpError::UnexpectedContentType(
                other.map(str::to_string),
            )),
        }
    }

    async fn delete_session(
        &self,
        uri: Arc<str>,
        session_id: SessionId,
    ) -> Result<(), StreamableHttpError<Self::Error>> {
        let response = self
            .delete(uri.as_ref())
            .header(HEADER_SESSION_ID, session_id.as_ref())
            .send()
            .await
            .map_err(StreamableHttpError::Client)?;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Err(StreamableHttpError::ServerDoesNotSupportDeleteSession);
        }
        response
            .error_for_status()
            .map(drop)
            .map_err(StreamableHttpError::Client)
    }

    async fn get_stream(
        &self,
        uri: Arc<str>,
        session_id: SessionId,
        last_event_id: Option<String>,
    ) -> Result<BoxedSseResponse, StreamableHttpError<Self::Error>> {
        let mut request = self
            .get(uri.as_ref())
            .header(reqwest::header::ACCEPT, EVENT_STREAM_MIME_TYPE)
            .header(HEADER_SESSION_ID, session_id.as_ref());
        if let Some(last_event_id) = last_event_id {
            request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
        }
        let response = request
            .send()
            .await
            .map_err(StreamableHttpError::Client)?;
        if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED {
            return Err(StreamableHttpError::ServerDoesNotSupportSse);
        }
        let response = response
            .error_for_status()
            .map_err(StreamableHttpError::Client)?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        match content_type {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {
                Ok(SseStream::from_bytes_stream(response.bytes_stream()).boxed())
            }
            other => Err(StreamableHttpError::UnexpectedContentType(
                other.map(str::to_string),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamableHttpClientConfig {
    pub uri: Arc<str>,
    pub retry: SseRetryConfig,
    pub channel_buffer_capacity: usize,
}

impl StreamableHttpClientConfig {
    pub fn new(uri: impl Into<Arc<str>>) -> Self {
        Self {
            uri: uri.into(),
            retry: SseRetryConfig::default(),
            channel_buffer_capacity: 16,
        }
    }
}

pub struct StreamableHttpClientWorker<C: StreamableHttpClient> {
    client: C,
    config: StreamableHttpClientConfig,
}

/// Drains one SSE stream into the session, resuming with `Last-Event-ID`
/// when the stream breaks mid-flight. Streams that end cleanly are done.
async fn pump_stream<C: StreamableHttpClient>(
    client: C,
    uri: Arc<str>,
    session_id: SessionId,
    mut stream: BoxedSseResponse,
    tx: mpsc::Sender<JsonRpcMessage>,
    retry: SseRetryConfig,
    ct: CancellationToken,
) {
    let mut last_event_id: Option<String> = None;
    let mut server_retry_ms: Option<u64> = None;
    let mut retried = 0usize;
    loop {
        let event = tokio::select! {
            _ = ct.cancelled() => return,
            event = stream.next() => event,
        };
        match event {
            Some(Ok(sse)) => {
                retried = 0;
                if let Some(id) = sse.id {
                    last_event_id = Some(id);
                }
                if let Some(retry) = sse.retry {
                    server_retry_ms = Some(retry);
                }
                let Some(data) = sse.data else { continue };
                match serde_json::from_str::<JsonRpcMessage>(&data) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "skipping malformed sse frame");
                    }
                }
            }
            None => return,
            Some(Err(error)) => {
                tracing::warn!(%error, "sse stream broke, attempting resume");
                let Some(resume_from) = last_event_id.clone() else {
                    return;
                };
                loop {
                    let Some(delay) = retry.delay(retried, server_retry_ms) else {
                        tracing::warn!("resume attempts exhausted, dropping stream");
                        return;
                    };
                    retried += 1;
                    tokio::select! {
                        _ = ct.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match client
                        .get_stream(uri.clone(), session_id.clone(), Some(resume_from.clone()))
                        .await
                    {
                        Ok(new_stream) => {
                            stream = new_stream;
                            break;
                        }
                        Err(error) => {
                            tracing::warn!(%error, attempt = retried, "resume failed");
                        }
                    }
                }
            }
        }
    }
}

impl<C: StreamableHttpClient> Worker for StreamableHttpClientWorker<C> {
    type Error = StreamableHttpError<C::Error>;

    fn err_closed() -> Self::Error {
        StreamableHttpError::TransportChannelClosed
    }

    fn err_join(error: tokio::task::JoinError) -> Self::Error {
        StreamableHttpError::Join(error)
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            name: Some("streamable-http-client".into()),
            channel_buffer_capacity: self.config.channel_buffer_capacity,
        }
    }

    async fn run(self, mut context: WorkerContext<Self>) -> Result<(), WorkerQuitReason> {
        let ct = context.cancellation_token.clone();
        let handler_tx = context.handler_sender();
        let uri = self.config.uri.clone();

        // The first outbound message opens the session; the server must
        // answer it with a JSON body and assign a session id.
        let WorkerSendRequest { message, responder } = tokio::select! {
            _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
            send = context.recv_from_handler() => send?,
        };
        let response = self
            .client
            .post_message(uri.clone(), message, None)
            .await;
        let (response_message, session_id) = match response {
            Ok(StreamableHttpPostResponse::Json(message, Some(session_id))) => {
                (message, SessionId::from(session_id))
            }
            Ok(other) => {
                let reason = format!("expected json initialize response with session id, got {other:?}");
                let _ = responder.send(Err(StreamableHttpError::UnexpectedServerResponse(
                    reason.clone().into(),
                )));
                return Err(WorkerQuitReason::fatal(
                    StreamableHttpError::<C::Error>::UnexpectedServerResponse(reason.into()),
                    "open session",
                ));
            }
            Err(error) => {
                let _ = responder.send(Err(error));
                return Err(WorkerQuitReason::TransportClosed);
            }
        };
        let _ = responder.send(Ok(()));
        tracing::debug!(%session_id, "streamable http session opened");
        context.send_to_handler(response_message).await?;

        // Standalone stream for server-initiated messages; optional on the
        // server side.
        match self
            .client
            .get_stream(uri.clone(), session_id.clone(), None)
            .await
        {
            Ok(stream) => {
                tokio::spawn(pump_stream(
                    self.client.clone(),
                    uri.clone(),
                    session_id.clone(),
                    stream,
                    handler_tx.clone(),
                    self.config.retry.clone(),
                    ct.child_token(),
                ));
            }
            Err(StreamableHttpError::ServerDoesNotSupportSse) => {
                tracing::debug!("server does not offer a standalone stream");
            }
            Err(error) => {
                return Err(WorkerQuitReason::fatal(error, "open standalone stream"));
            }
        }

        let quit = loop {
            let send = tokio::select! {
                _ = ct.cancelled() => break WorkerQuitReason::Cancelled,
                send = context.recv_from_handler() => send,
            };
            let WorkerSendRequest { message, responder } = match send {
                Ok(send) => send,
                Err(reason) => break reason,
            };
            match self
                .client
                .post_message(uri.clone(), message, Some(session_id.clone()))
                .await
            {
                Ok(StreamableHttpPostResponse::Accepted) => {
                    let _ = responder.send(Ok(()));
                }
                Ok(StreamableHttpPostResponse::Json(message, _)) => {
                    let _ = responder.send(Ok(()));
                    context.send_to_handler(message).await?;
                }
                Ok(StreamableHttpPostResponse::Sse(stream, _)) => {
                    let _ = responder.send(Ok(()));
                    tokio::spawn(pump_stream(
                        self.client.clone(),
                        uri.clone(),
                        session_id.clone(),
                        stream,
                        handler_tx.clone(),
                        self.config.retry.clone(),
                        ct.child_token(),
                    ));
                }
                Err(error) => {
                    tracing::error!(%error, "post failed");
                    let _ = responder.send(Err(error));
                }
            }
        };

        // Tell the server the session is over. Best effort.
        match self.client.delete_session(uri, session_id).await {
            Ok(()) => {}
            Err(StreamableHttpError::ServerDoesNotSupportDeleteSession) => {}
            Err(error) => tracing::warn!(%error, "failed to delete session"),
        }
        Err(quit)
    }
}

pub struct StreamableHttpClientTransport<C: StreamableHttpClient> {
    inner: WorkerTransport<StreamableHttpClientWorker<C>>,
}

impl StreamableHttpClientTransport<reqwest::Client> {
    pub fn start(uri: impl Into<Arc<str>>) -> Self {
        Self::start_with_client(
            reqwest::Client::default(),
            StreamableHttpClientConfig::new(uri),
        )
    }
}

impl<C: StreamableHttpClient> StreamableHttpClientTransport<C> {
    pub fn start_with_client(client: C, config: StreamableHttpClientConfig) -> Self {
        Self {
            inner: WorkerTransport::spawn(StreamableHttpClientWorker { client, config }),
        }
    }
}

impl<C: StreamableHttpClient> Transport for StreamableHttpClientTransport<C> {
    type Error = StreamableHttpError<C::Error>;

    fn send(
        &mut self,
        item: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.inner.send(item)
    }

    fn receive(&mut self) -> impl Future<Output = Option<JsonRpcMessage>> + Send {
        self.inner.receive()
    }

    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        self.inner.close()
    }
}
