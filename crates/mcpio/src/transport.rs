//! Transport layer: how [`JsonRpcMessage`] frames get on and off the wire.
//!
//! A transport is a duplex channel with single-consumer receive semantics:
//! the session's event loop is the only reader. `receive()` yields `None`
//! exactly once the underlying medium reaches EOF and keeps yielding `None`
//! afterwards; `send()` after close fails instead of silently dropping.
//!
//! Concrete bindings:
//! * [`async_rw`] — newline-delimited framing over any `AsyncRead`/`AsyncWrite`
//!   pair, including stdio.
//! * [`child_process`] — stdio framing over a spawned child process.
//! * [`sse_client`] / [`sse_server`] — HTTP+SSE transport.
//! * [`streamable_http_client`] / [`streamable_http_server`] — the streamable
//!   HTTP transport (`POST`/`GET`/`DELETE` on one endpoint).
//! * [`worker`] — adapter that runs a transport state machine on its own task.

use futures::{Sink, SinkExt, Stream, StreamExt};

use crate::model::JsonRpcMessage;

pub mod async_rw;
pub mod auth;
pub mod child_process;
pub mod common;
pub mod sse_client;
pub mod sse_server;
pub mod streamable_http_client;
pub mod streamable_http_server;
pub mod worker;

pub use async_rw::{AsyncRwTransport, stdio};
pub use child_process::TokioChildProcess;
pub use sse_client::{SseClientTransport, SseTransportError};
pub use sse_server::{SseServer, SseServerConfig};
pub use streamable_http_client::{StreamableHttpClientTransport, StreamableHttpError};
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};
pub use worker::{Worker, WorkerTransport};

pub trait Transport: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send one message to the peer. An error after close is `Err`, never a
    /// silent drop.
    fn send(
        &mut self,
        item: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Receive the next inbound message. `None` means EOF and stays `None`.
    fn receive(&mut self) -> impl Future<Output = Option<JsonRpcMessage>> + Send;

    /// Close the transport. Calling this twice is a no-op.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Type-erased transport error, for error enums that must not be generic
/// over the transport type.
#[derive(Debug)]
pub struct DynamicTransportError {
    type_name: &'static str,
    error: Box<dyn std::error::Error + Send + Sync>,
}

impl DynamicTransportError {
    pub fn new<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self {
            type_name: std::any::type_name::<E>(),
            error: Box::new(error),
        }
    }
}

impl std::fmt::Display for DynamicTransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.error, self.type_name)
    }
}

impl std::error::Error for DynamicTransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Conversion into a transport. The adapter marker `A` keeps the blanket
/// impls coherent; callers stay generic over it.
pub trait IntoTransport<E, A>: Send + 'static
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<Error = E> + 'static;
}

pub enum TransportAdapterIdentity {}
pub enum TransportAdapterSinkStream {}
pub enum TransportAdapterCombined {}
pub enum TransportAdapterAsyncRw {}

impl<T, E> IntoTransport<E, TransportAdapterIdentity> for T
where
    T: Transport<Error = E> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<Error = E> + 'static {
        self
    }
}

/// A transport assembled from an independent sink and stream, e.g. a pair of
/// in-process channels for tests.
pub struct SinkStreamTransport<Si, St> {
    sink: Si,
    stream: St,
    closed: bool,
}

impl<Si, St> SinkStreamTransport<Si, St> {
    pub fn new(sink: Si, stream: St) -> Self {
        Self {
            sink,
            stream,
            closed: false,
        }
    }
}

impl<Si, St, E> Transport for SinkStreamTransport<Si, St>
where
    Si: Sink<JsonRpcMessage, Error = E> + Send + Unpin,
    St: Stream<Item = JsonRpcMessage> + Send + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        self.sink.send(item).await
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        if self.closed {
            return None;
        }
        let next = self.stream.next().await;
        if next.is_none() {
            self.closed = true;
        }
        next
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.sink.close().await
    }
}

impl<Si, St, E> IntoTransport<E, TransportAdapterSinkStream> for (Si, St)
where
    Si: Sink<JsonRpcMessage, Error = E> + Send + Unpin + 'static,
    St: Stream<Item = JsonRpcMessage> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<Error = E> + 'static {
        SinkStreamTransport::new(self.0, self.1)
    }
}

/// Wrapper for a single type that is both `Sink` and `Stream`.
pub struct CombinedTransport<T> {
    inner: T,
    closed: bool,
}

impl<T, E> Transport for CombinedTransport<T>
where
    T: Sink<JsonRpcMessage, Error = E> + Stream<Item = JsonRpcMessage> + Send + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        self.inner.send(item).await
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        if self.closed {
            return None;
        }
        let next = self.inner.next().await;
        if next.is_none() {
            self.closed = true;
        }
        next
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.close().await
    }
}

impl<T, E> IntoTransport<E, TransportAdapterCombined> for T
where
    T: Sink<JsonRpcMessage, Error = E> + Stream<Item = JsonRpcMessage> + Send + Unpin + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_transport(self) -> impl Transport<Error = E> + 'static {
        CombinedTransport {
            inner: self,
            closed: false,
        }
    }
}

impl<R, W> IntoTransport<std::io::Error, TransportAdapterAsyncRw> for (R, W)
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    fn into_transport(self) -> impl Transport<Error = std::io::Error> + 'static {
        AsyncRwTransport::new(self.0, self.1)
    }
}
