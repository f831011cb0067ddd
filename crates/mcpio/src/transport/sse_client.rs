//! Client side of the HTTP+SSE transport: a long-lived `GET` event stream
//! for inbound messages, `POST`s to a server-announced endpoint for outbound.

use futures::StreamExt;
use sse_stream::SseStream;
use thiserror::Error;
use url::Url;

use crate::{
    model::JsonRpcMessage,
    transport::{
        Transport,
        common::{
            http_header::{EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID},
            sse::{BoxedSseResponse, SseRetryConfig},
        },
        worker::{Worker, WorkerConfig, WorkerContext, WorkerQuitReason, WorkerTransport},
    },
};

/// Event type the server uses to announce its message endpoint.
const ENDPOINT_EVENT: &str = "endpoint";

#[derive(Debug, Error)]
pub enum SseTransportError<E: std::error::Error + Send + Sync + 'static> {
    #[error("client error: {0}")]
    Client(E),
    #[error("unexpected content type: {0:?}")]
    UnexpectedContentType(Option<String>),
    #[error("invalid uri: {0}")]
    InvalidUri(#[from] url::ParseError),
    #[error("transport channel closed")]
    TransportChannelClosed,
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Violations of the SSE transport protocol itself, as opposed to HTTP-level
/// failures.
#[derive(Debug, Error)]
pub enum SseProtocolError {
    #[error("endpoint event carried no data")]
    MissingEndpointData,
    #[error("invalid endpoint url: {0}")]
    InvalidEndpoint(url::ParseError),
    #[error("endpoint origin mismatch: expected {expected}, got {actual}")]
    EndpointOriginMismatch { expected: String, actual: String },
}

/// HTTP operations the SSE worker needs. Implemented for [`reqwest::Client`].
pub trait SseClient: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn connect(
        &self,
        uri: Url,
        last_event_id: Option<String>,
    ) -> impl Future<Output = Result<BoxedSseResponse, SseTransportError<Self::Error>>> + Send;

    fn post_message(
        &self,
        uri: Url,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), SseTransportError<Self::Error>>> + Send;
}

impl SseClient for reqwest::Client {
    type Error = reqwest::Error;

    async fn connect(
        &self,
        uri: Url,
        last_event_id: Option<String>,
    ) -> Result<BoxedSseResponse, SseTransportError<Self::Error>> {
        let mut request = self
            .get(uri)
            .header(reqwest::header::ACCEPT, EVENT_STREAM_MIME_TYPE);
        if let Some(last_event_id) = last_event_id {
            request = request.header(HEADER_LAST_EVENT_ID, last_event_id);
        }
        let response = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(SseTransportError::Client)?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok());
        match content_type {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {}
            other => {
                return Err(SseTransportError::UnexpectedContentType(
                    other.map(str::to_string),
                ));
            }
        }
        Ok(SseStream::from_bytes_stream(response.bytes_stream()).boxed())
    }

    async fn post_message(
        &self,
        uri: Url,
        message: JsonRpcMessage,
    ) -> Result<(), SseTransportError<Self::Error>> {
        self.post(uri)
            .json(&message)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map(drop)
            .map_err(SseTransportError::Client)
    }
}

#[derive(Debug, Clone)]
pub struct SseClientConfig {
    pub sse_endpoint: Url,
    pub retry: SseRetryConfig,
}

pub struct SseClientWorker<C: SseClient> {
    client: C,
    config: SseClientConfig,
}

impl<C: SseClient> SseClientWorker<C> {
    async fn reconnect(
        &self,
        last_event_id: Option<&str>,
        retried: &mut usize,
        server_retry_ms: Option<u64>,
        ct: &tokio_util::sync::CancellationToken,
    ) -> Result<BoxedSseResponse, WorkerQuitReason> {
        loop {
            let Some(delay) = self.config.retry.delay(*retried, server_retry_ms) else {
                tracing::warn!("sse reconnect attempts exhausted");
                return Err(WorkerQuitReason::TransportClosed);
            };
            *retried += 1;
            tokio::select! {
                _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            match self
                .client
                .connect(
                    self.config.sse_endpoint.clone(),
                    last_event_id.map(str::to_string),
                )
                .await
            {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    tracing::warn!(%error, attempt = *retried, "sse reconnect failed");
                }
            }
        }
    }
}

async fn wait_for_endpoint(stream: &mut BoxedSseResponse) -> Result<String, WorkerQuitReason> {
    loop {
        match stream.next().await {
            Some(Ok(sse)) => {
                if sse.event.as_deref() == Some(ENDPOINT_EVENT) {
                    return sse.data.ok_or_else(|| {
                        WorkerQuitReason::fatal(
                            SseProtocolError::MissingEndpointData,
                            "wait for endpoint event",
                        )
                    });
                }
                tracing::debug!(event = ?sse.event, "ignoring pre-endpoint event");
            }
            Some(Err(error)) => {
                return Err(WorkerQuitReason::fatal(error, "wait for endpoint event"));
            }
            None => return Err(WorkerQuitReason::TransportClosed),
        }
    }
}

/// The message endpoint must share the event stream's origin; anything else
/// would let a compromised stream redirect outbound messages.
fn resolve_endpoint(base: &Url, raw: &str) -> Result<Url, WorkerQuitReason> {
    let endpoint = base.join(raw).map_err(|error| {
        WorkerQuitReason::fatal(
            SseProtocolError::InvalidEndpoint(error),
            "resolve endpoint url",
        )
    })?;
    let same_origin = endpoint.scheme() == base.scheme()
        && endpoint.host_str() == base.host_str()
        && endpoint.port_or_known_default() == base.port_or_known_default();
    if !same_origin {
        return Err(WorkerQuitReason::fatal(
            SseProtocolError::EndpointOriginMismatch {
                expected: base.origin().ascii_serialization(),
                actual: endpoint.origin().ascii_serialization(),
            },
            "validate endpoint origin",
        ));
    }
    Ok(endpoint)
}

impl<C: SseClient> Worker for SseClientWorker<C> {
    type Error = SseTransportError<C::Error>;

    fn err_closed() -> Self::Error {
        SseTransportError::TransportChannelClosed
    }

    fn err_join(error: tokio::task::JoinError) -> Self::Error {
        SseTransportError::Join(error)
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            name: Some("sse-client".into()),
            ..WorkerConfig::default()
        }
    }

    async fn run(self, mut context: WorkerContext<Self>) -> Result<(), WorkerQuitReason> {
        let ct = context.cancellation_token.clone();
        let mut stream = tokio::select! {
            _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
            result = self.client.connect(self.config.sse_endpoint.clone(), None) => {
                result.map_err(WorkerQuitReason::fatal_context("connect sse stream"))?
            }
        };

        // The server speaks first: an `endpoint` event naming the POST target.
        let endpoint = tokio::select! {
            _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
            endpoint = wait_for_endpoint(&mut stream) => endpoint?,
        };
        let endpoint = resolve_endpoint(&self.config.sse_endpoint, &endpoint)?;
        tracing::debug!(%endpoint, "sse transport ready");

        let mut last_event_id: Option<String> = None;
        let mut server_retry_ms: Option<u64> = None;
        let mut retried = 0usize;
        loop {
            tokio::select! {
                _ = ct.cancelled() => return Err(WorkerQuitReason::Cancelled),
                send = context.recv_from_handler() => {
                    let send = send?;
                    let result = self.client.post_message(endpoint.clone(), send.message).await;
                    let _ = send.responder.send(result);
                }
                event = stream.next() => {
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
                                Ok(message) => context.send_to_handler(message).await?,
                                Err(error) => {
                                    tracing::warn!(%error, "skipping malformed sse frame");
                                }
                            }
                        }
                        Some(Err(error)) => {
                            tracing::warn!(%error, "sse stream error, reconnecting");
                            stream = self
                                .reconnect(last_event_id.as_deref(), &mut retried, server_retry_ms, &ct)
                                .await?;
                        }
                        None => {
                            tracing::debug!("sse stream ended, reconnecting");
                            stream = self
                                .reconnect(last_event_id.as_deref(), &mut retried, server_retry_ms, &ct)
                                .await?;
                        }
                    }
                }
            }
        }
    }
}

pub struct SseClientTransport<C: SseClient> {
    inner: WorkerTransport<SseClientWorker<C>>,
}

impl SseClientTransport<reqwest::Client> {
    /// Connect with a default [`reqwest::Client`].
    pub fn start(
        uri: impl AsRef<str>,
    ) -> Result<Self, SseTransportError<reqwest::Error>> {
        let sse_endpoint = Url::parse(uri.as_ref())?;
        Ok(Self::start_with_client(
            reqwest::Client::default(),
            SseClientConfig {
                sse_endpoint,
                retry: SseRetryConfig::default(),
            },
        ))
    }
}

impl<C: SseClient> SseClientTransport<C> {
    pub fn start_with_client(client: C, config: SseClientConfig) -> Self {
        Self {
            inner: WorkerTransport::spawn(SseClientWorker { client, config }),
        }
    }
}

impl<C: SseClient> Transport for SseClientTransport<C> {
    type Error = SseTransportError<C::Error>;

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_must_share_origin() {
        let base = Url::parse("http://127.0.0.1:8000/sse").unwrap();
        assert!(resolve_endpoint(&base, "/message?sessionId=abc").is_ok());
        assert!(resolve_endpoint(&base, "http://127.0.0.1:8000/message").is_ok());
        assert!(resolve_endpoint(&base, "http://evil.example/message").is_err());
        assert!(resolve_endpoint(&base, "https://127.0.0.1:8000/message").is_err());
    }
}
