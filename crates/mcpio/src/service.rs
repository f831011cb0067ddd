//! Session engine: request/response correlation, handler dispatch, and
//! cooperative cancellation over any [`Transport`].
//!
//! Both roles share one event loop. The loop is the single consumer of the
//! transport's inbound side and the single owner of the pending-request
//! table; handlers and callers reach it only through [`Peer`].

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    model::{
        CANCELLED_NOTIFICATION_METHOD, CancelledNotificationParam, ErrorData, INITIALIZE_METHOD,
        INITIALIZED_NOTIFICATION_METHOD, InitializeRequestParam, InitializeResult, JsonObject,
        JsonRpcMessage, JsonRpcNotification, JsonRpcRequest, PING_METHOD,
        PROGRESS_NOTIFICATION_METHOD, ProgressNotificationParam, ProtocolVersion, RequestId,
    },
    transport::{DynamicTransportError, IntoTransport, Transport},
};

pub mod router;
pub use router::Router;

/// Errors surfaced to callers of [`Peer::send_request`] and friends.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("mcp error: {0}")]
    McpError(ErrorData),
    #[error("transport error: {error}, when {context}")]
    Transport {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },
    #[error("request timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("request cancelled (reason: {reason:?})")]
    Cancelled { reason: Option<String> },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("unexpected response shape")]
    UnexpectedResponse,
}

/// Session-scoped monotonic request id source.
#[derive(Debug, Default)]
pub struct AtomicU32RequestIdProvider {
    id: AtomicU32,
}

impl AtomicU32RequestIdProvider {
    pub fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.id.fetch_add(1, Ordering::Relaxed))
    }
}

/// What the peer told us during the handshake.
#[derive(Debug, Clone)]
pub enum PeerInfo {
    /// We are the server; this is the client's `initialize` params.
    Client(InitializeRequestParam),
    /// We are the client; this is the server's `initialize` result.
    Server(InitializeResult),
}

impl PeerInfo {
    pub fn protocol_version(&self) -> &ProtocolVersion {
        match self {
            PeerInfo::Client(info) => &info.protocol_version,
            PeerInfo::Server(info) => &info.protocol_version,
        }
    }
}

pub type ProgressCallback = Arc<dyn Fn(ProgressNotificationParam) + Send + Sync>;

/// Per-call options for [`Peer::send_request_with`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Local deadline measured from send time. Purely local bookkeeping: no
    /// cancellation notification is sent when it fires.
    pub timeout: Option<Duration>,
    /// Invoked for each `notifications/progress` correlated to this request.
    pub on_progress: Option<ProgressCallback>,
}

/// Options for [`Peer::cancel_request`].
#[derive(Debug, Clone)]
pub struct CancelOptions {
    pub reason: Option<String>,
    /// How long to keep waiting for a genuine response after the cancel
    /// notification went out. Completion wins the race; after the grace
    /// period the waiter resolves with [`ServiceError::Cancelled`].
    pub grace: Duration,
}

impl Default for CancelOptions {
    fn default() -> Self {
        Self {
            reason: None,
            grace: Duration::from_secs(2),
        }
    }
}

/// Context handed to request handlers.
#[derive(Clone)]
pub struct RequestContext {
    pub id: RequestId,
    /// Cancelled when the peer sends `notifications/cancelled` for this
    /// request, or when the whole session shuts down. Cooperative: check it
    /// at suspension points.
    pub ct: CancellationToken,
    pub peer: Peer,
}

#[derive(Clone)]
pub struct NotificationContext {
    pub peer: Peer,
}

/// The business-logic seam: requests and notifications dispatched by method
/// name. Use [`Router`] for a map-of-handlers implementation, or implement
/// this directly.
pub trait Service: Send + Sync + 'static {
    fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> impl Future<Output = Result<Value, ErrorData>> + Send;

    fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        context: NotificationContext,
    ) -> impl Future<Output = ()> + Send;
}

/// A service with no handlers: every request is method-not-found, every
/// notification is ignored. Useful for pure clients.
impl Service for () {
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        _context: RequestContext,
    ) -> Result<Value, ErrorData> {
        Err(ErrorData::method_not_found(&request.method))
    }

    async fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        _context: NotificationContext,
    ) {
        tracing::debug!(method = %notification.method, "ignoring notification");
    }
}

impl<S: Service> Service for Arc<S> {
    fn handle_request(
        &self,
        request: JsonRpcRequest,
        context: RequestContext,
    ) -> impl Future<Output = Result<Value, ErrorData>> + Send {
        self.as_ref().handle_request(request, context)
    }

    fn handle_notification(
        &self,
        notification: JsonRpcNotification,
        context: NotificationContext,
    ) -> impl Future<Output = ()> + Send {
        self.as_ref().handle_notification(notification, context)
    }
}

pub(crate) enum PeerMessage {
    Request {
        message: JsonRpcMessage,
        id: RequestId,
        responder: oneshot::Sender<Result<Value, ServiceError>>,
        on_progress: Option<ProgressCallback>,
    },
    Notification {
        message: JsonRpcMessage,
        responder: oneshot::Sender<Result<(), ServiceError>>,
    },
    Cancel {
        id: RequestId,
        reason: Option<String>,
        grace: Duration,
    },
    CancelExpired {
        id: RequestId,
        reason: Option<String>,
    },
    Untrack {
        id: RequestId,
    },
}

/// Handle to the remote side of a session. Cloneable; all methods go through
/// the session's event loop, which owns the correlation state.
#[derive(Clone)]
pub struct Peer {
    tx: mpsc::Sender<PeerMessage>,
    id_provider: Arc<AtomicU32RequestIdProvider>,
    info: Arc<OnceLock<PeerInfo>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("info", &self.info.get())
            .finish()
    }
}

const PEER_CHANNEL_CAPACITY: usize = 64;

impl Peer {
    pub(crate) fn new(
        id_provider: Arc<AtomicU32RequestIdProvider>,
    ) -> (Self, mpsc::Receiver<PeerMessage>) {
        let (tx, rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        (
            Self {
                tx,
                id_provider,
                info: Arc::new(OnceLock::new()),
            },
            rx,
        )
    }

    pub(crate) fn set_info(&self, info: PeerInfo) {
        let _ = self.info.set(info);
    }

    pub fn peer_info(&self) -> Option<&PeerInfo> {
        self.info.get()
    }

    /// Send a request and wait for its correlated response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, ServiceError> {
        self.send_request_with(method, params, RequestOptions::default())
            .await
    }

    pub async fn send_request_with(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, ServiceError> {
        let timeout = options.timeout;
        let handle = self
            .start_request(method, params, options.on_progress)
            .await?;
        match timeout {
            None => handle.await_response().await,
            Some(timeout) => handle.await_response_timeout(timeout).await,
        }
    }

    /// Register a request without awaiting its response; the returned handle
    /// exposes the allocated [`RequestId`] so the call can be cancelled from
    /// another task.
    pub async fn start_request(
        &self,
        method: &str,
        mut params: Option<Value>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<RequestHandle, ServiceError> {
        let id = self.id_provider.next_request_id();
        if on_progress.is_some() {
            params = Some(inject_progress_token(params, &id));
        }
        let (responder, rx) = oneshot::channel();
        let message = JsonRpcMessage::request(id.clone(), method, params);
        self.tx
            .send(PeerMessage::Request {
                message,
                id: id.clone(),
                responder,
                on_progress,
            })
            .await
            .map_err(|_| ServiceError::ConnectionClosed)?;
        Ok(RequestHandle {
            id,
            rx,
            peer: self.clone(),
        })
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), ServiceError> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(PeerMessage::Notification {
                message: JsonRpcMessage::notification(method, params),
                responder,
            })
            .await
            .map_err(|_| ServiceError::ConnectionClosed)?;
        rx.await.map_err(|_| ServiceError::ConnectionClosed)?
    }

    pub async fn notify_progress(
        &self,
        params: ProgressNotificationParam,
    ) -> Result<(), ServiceError> {
        self.send_notification(
            PROGRESS_NOTIFICATION_METHOD,
            serde_json::to_value(params).ok(),
        )
        .await
    }

    pub async fn notify_cancelled(
        &self,
        params: CancelledNotificationParam,
    ) -> Result<(), ServiceError> {
        self.send_notification(
            CANCELLED_NOTIFICATION_METHOD,
            serde_json::to_value(params).ok(),
        )
        .await
    }

    /// Ask the peer to cancel an in-flight request we issued. Sends
    /// `notifications/cancelled` and starts the grace-period timer; the
    /// original waiter resolves with the real response if it arrives first,
    /// otherwise with [`ServiceError::Cancelled`].
    pub async fn cancel_request(
        &self,
        id: RequestId,
        options: CancelOptions,
    ) -> Result<(), ServiceError> {
        self.tx
            .send(PeerMessage::Cancel {
                id,
                reason: options.reason,
                grace: options.grace,
            })
            .await
            .map_err(|_| ServiceError::ConnectionClosed)
    }
}

/// An in-flight outbound request.
pub struct RequestHandle {
    pub id: RequestId,
    rx: oneshot::Receiver<Result<Value, ServiceError>>,
    peer: Peer,
}

impl RequestHandle {
    pub async fn await_response(self) -> Result<Value, ServiceError> {
        self.rx.await.map_err(|_| ServiceError::ConnectionClosed)?
    }

    /// Wait with a local deadline. On expiry the waiter is deregistered and a
    /// late response is treated as unsolicited; no wire cancel is sent.
    pub async fn await_response_timeout(self, timeout: Duration) -> Result<Value, ServiceError> {
        let id = self.id.clone();
        let peer = self.peer.clone();
        match tokio::time::timeout(timeout, self.await_response()).await {
            Ok(result) => result,
            Err(_) => {
                let _ = peer.tx.send(PeerMessage::Untrack { id }).await;
                Err(ServiceError::Timeout { timeout })
            }
        }
    }
}

fn inject_progress_token(params: Option<Value>, id: &RequestId) -> Value {
    let mut object = match params {
        Some(Value::Object(object)) => object,
        _ => JsonObject::default(),
    };
    let token = match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::from(s.as_ref()),
    };
    let meta = object
        .entry("_meta".to_string())
        .or_insert_with(|| Value::Object(JsonObject::default()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), token);
    }
    Value::Object(object)
}

#[derive(Debug, Error)]
pub enum ClientInitializeError {
    #[error("expected initialize response, but received: {0:?}")]
    ExpectedInitResponse(Option<JsonRpcMessage>),

    #[error("conflict initialize response id: expected {0}, got {1}")]
    ConflictInitResponseId(RequestId, RequestId),

    #[error("failed to serialize initialize request params: {0}")]
    MalformedInitParams(serde_json::Error),

    #[error("malformed initialize result: {0}")]
    MalformedInitResult(serde_json::Error),

    #[error("initialize failed: {0}")]
    InitializeFailed(ErrorData),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("send message error {error}, when {context}")]
    TransportError {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum ServerInitializeError {
    #[error("expected initialize request, but received: {0:?}")]
    ExpectedInitializeRequest(Option<JsonRpcMessage>),

    #[error("expected initialized notification, but received: {0:?}")]
    ExpectedInitializedNotification(Option<JsonRpcMessage>),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(ProtocolVersion),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("send message error {error}, when {context}")]
    TransportError {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },

    #[error("cancelled")]
    Cancelled,
}

fn client_transport_error<E>(context: &'static str) -> impl FnOnce(E) -> ClientInitializeError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |error| ClientInitializeError::TransportError {
        error: DynamicTransportError::new(error),
        context: Cow::Borrowed(context),
    }
}

fn server_transport_error<E>(context: &'static str) -> impl FnOnce(E) -> ServerInitializeError
where
    E: std::error::Error + Send + Sync + 'static,
{
    move |error| ServerInitializeError::TransportError {
        error: DynamicTransportError::new(error),
        context: Cow::Borrowed(context),
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitReason {
    /// Local cancellation via [`RunningService::cancel`].
    Cancelled,
    /// The transport's read side reached EOF or broke.
    Closed,
}

/// A served session: the spawned event loop plus the [`Peer`] talking to it.
pub struct RunningService {
    peer: Peer,
    ct: CancellationToken,
    handle: tokio::task::JoinHandle<QuitReason>,
}

impl std::fmt::Debug for RunningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningService")
            .field("peer", &self.peer)
            .field("cancelled", &self.ct.is_cancelled())
            .finish()
    }
}

impl RunningService {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.ct.clone()
    }

    /// Wait for the session to end on its own (peer disconnect).
    pub async fn waiting(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.handle.await
    }

    /// Tear the session down. Every pending waiter resolves with
    /// [`ServiceError::ConnectionClosed`] before this returns.
    pub async fn cancel(self) -> Result<QuitReason, tokio::task::JoinError> {
        self.ct.cancel();
        self.handle.await
    }
}

/// Connect as the client: send `initialize`, verify the negotiated protocol
/// version, send `notifications/initialized`, then start the event loop.
pub async fn serve_client<S, T, E, A>(
    service: S,
    transport: T,
    info: InitializeRequestParam,
) -> Result<RunningService, ClientInitializeError>
where
    S: Service,
    T: IntoTransport<E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_client_with_ct(service, transport, info, CancellationToken::new()).await
}

pub async fn serve_client_with_ct<S, T, E, A>(
    service: S,
    transport: T,
    info: InitializeRequestParam,
    ct: CancellationToken,
) -> Result<RunningService, ClientInitializeError>
where
    S: Service,
    T: IntoTransport<E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    let transport = transport.into_transport();
    tokio::select! {
        result = serve_client_inner(service, transport, info, ct.clone()) => result,
        _ = ct.cancelled() => Err(ClientInitializeError::Cancelled),
    }
}

async fn serve_client_inner<S, T>(
    service: S,
    mut transport: T,
    info: InitializeRequestParam,
    ct: CancellationToken,
) -> Result<RunningService, ClientInitializeError>
where
    S: Service,
    T: Transport + 'static,
{
    let id_provider = <Arc<AtomicU32RequestIdProvider>>::default();
    let id = id_provider.next_request_id();
    let params = serde_json::to_value(&info).map_err(ClientInitializeError::MalformedInitParams)?;
    transport
        .send(JsonRpcMessage::request(
            id.clone(),
            INITIALIZE_METHOD,
            Some(params),
        ))
        .await
        .map_err(client_transport_error("send initialize request"))?;

    let message = transport
        .receive()
        .await
        .ok_or_else(|| ClientInitializeError::ConnectionClosed("initialize response".into()))?;
    let result: InitializeResult = match message {
        JsonRpcMessage::Response(response) if response.id == id => {
            serde_json::from_value(response.result)
                .map_err(ClientInitializeError::MalformedInitResult)?
        }
        JsonRpcMessage::Response(response) => {
            return Err(ClientInitializeError::ConflictInitResponseId(
                id,
                response.id,
            ));
        }
        JsonRpcMessage::Error(error) => {
            return Err(ClientInitializeError::InitializeFailed(error.error));
        }
        other => return Err(ClientInitializeError::ExpectedInitResponse(Some(other))),
    };

    if !result.protocol_version.is_supported() {
        return Err(ClientInitializeError::UnsupportedProtocolVersion(
            result.protocol_version,
        ));
    }

    transport
        .send(JsonRpcMessage::notification(
            INITIALIZED_NOTIFICATION_METHOD,
            None,
        ))
        .await
        .map_err(client_transport_error("send initialized notification"))?;

    let (peer, peer_rx) = Peer::new(id_provider);
    peer.set_info(PeerInfo::Server(result));
    Ok(serve_inner(service, transport, peer, peer_rx, ct))
}

/// Accept as the server: wait for the `initialize` request (answering `ping`
/// in the meantime), negotiate the protocol version, wait for
/// `notifications/initialized`, then start the event loop.
pub async fn serve_server<S, T, E, A>(
    service: S,
    transport: T,
    info: InitializeResult,
) -> Result<RunningService, ServerInitializeError>
where
    S: Service,
    T: IntoTransport<E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    serve_server_with_ct(service, transport, info, CancellationToken::new()).await
}

pub async fn serve_server_with_ct<S, T, E, A>(
    service: S,
    transport: T,
    info: InitializeResult,
    ct: CancellationToken,
) -> Result<RunningService, ServerInitializeError>
where
    S: Service,
    T: IntoTransport<E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    let transport = transport.into_transport();
    tokio::select! {
        result = serve_server_inner(service, transport, info, ct.clone()) => result,
        _ = ct.cancelled() => Err(ServerInitializeError::Cancelled),
    }
}

async fn serve_server_inner<S, T>(
    service: S,
    mut transport: T,
    mut info: InitializeResult,
    ct: CancellationToken,
) -> Result<RunningService, ServerInitializeError>
where
    S: Service,
    T: Transport + 'static,
{
    let id_provider = <Arc<AtomicU32RequestIdProvider>>::default();

    // Wait for initialize. Only `ping` is served before the handshake.
    let (client_info, request_id) = loop {
        let message = transport
            .receive()
            .await
            .ok_or_else(|| ServerInitializeError::ConnectionClosed("initialize request".into()))?;
        match message {
            JsonRpcMessage::Request(request) if request.method == PING_METHOD => {
                transport
                    .send(JsonRpcMessage::response(request.id, empty_object()))
                    .await
                    .map_err(server_transport_error("send ping response"))?;
            }
            JsonRpcMessage::Request(request) if request.method == INITIALIZE_METHOD => {
                let params: InitializeRequestParam =
                    match serde_json::from_value(request.params.unwrap_or(Value::Null)) {
                        Ok(params) => params,
                        Err(error) => {
                            let error_data = ErrorData::invalid_params(
                                format!("malformed initialize params: {error}"),
                                None,
                            );
                            transport
                                .send(JsonRpcMessage::error(request.id, error_data))
                                .await
                                .map_err(server_transport_error("send initialize error"))?;
                            return Err(ServerInitializeError::ExpectedInitializeRequest(None));
                        }
                    };
                break (params, request.id);
            }
            other => {
                return Err(ServerInitializeError::ExpectedInitializeRequest(Some(
                    other,
                )));
            }
        }
    };

    let requested = client_info.protocol_version.clone();
    if !requested.is_supported() {
        let error_data = ErrorData::invalid_params(
            "unsupported protocol version",
            Some(serde_json::json!({
                "supported": ProtocolVersion::SUPPORTED,
                "requested": requested,
            })),
        );
        transport
            .send(JsonRpcMessage::error(request_id, error_data))
            .await
            .map_err(server_transport_error("send unsupported version error"))?;
        return Err(ServerInitializeError::UnsupportedProtocolVersion(requested));
    }
    info.protocol_version = requested;

    let result =
        serde_json::to_value(&info).unwrap_or_else(|_| Value::Object(JsonObject::default()));
    transport
        .send(JsonRpcMessage::response(request_id, result))
        .await
        .map_err(server_transport_error("send initialize response"))?;

    // Wait for the initialized notification, still answering pings.
    loop {
        let message = transport.receive().await.ok_or_else(|| {
            ServerInitializeError::ConnectionClosed("initialized notification".into())
        })?;
        match message {
            JsonRpcMessage::Request(request) if request.method == PING_METHOD => {
                transport
                    .send(JsonRpcMessage::response(request.id, empty_object()))
                    .await
                    .map_err(server_transport_error("send ping response"))?;
            }
            JsonRpcMessage::Notification(notification)
                if notification.method == INITIALIZED_NOTIFICATION_METHOD =>
            {
                break;
            }
            other => {
                return Err(ServerInitializeError::ExpectedInitializedNotification(
                    Some(other),
                ));
            }
        }
    }

    let (peer, peer_rx) = Peer::new(id_provider);
    peer.set_info(PeerInfo::Client(client_info));
    Ok(serve_inner(service, transport, peer, peer_rx, ct))
}

/// Skip the handshake entirely; used by transports that run it themselves or
/// by tests exercising the raw loop.
pub fn serve_directly<S, T, E, A>(
    service: S,
    transport: T,
    info: Option<PeerInfo>,
    ct: CancellationToken,
) -> RunningService
where
    S: Service,
    T: IntoTransport<E, A>,
    E: std::error::Error + Send + Sync + 'static,
{
    let (peer, peer_rx) = Peer::new(Default::default());
    if let Some(info) = info {
        peer.set_info(info);
    }
    serve_inner(service, transport.into_transport(), peer, peer_rx, ct)
}

fn serve_inner<S, T>(
    service: S,
    transport: T,
    peer: Peer,
    peer_rx: mpsc::Receiver<PeerMessage>,
    ct: CancellationToken,
) -> RunningService
where
    S: Service,
    T: Transport + 'static,
{
    let service = Arc::new(service);
    let handle = tokio::spawn(event_loop(
        service,
        transport,
        peer.clone(),
        peer_rx,
        ct.clone(),
    ));
    RunningService { peer, ct, handle }
}

fn empty_object() -> Value {
    Value::Object(JsonObject::default())
}

struct LocalWaiter {
    responder: oneshot::Sender<Result<Value, ServiceError>>,
    on_progress: Option<ProgressCallback>,
    cancelling: bool,
}

/// Bounded memory of ids that were cancelled or timed out locally, so a late
/// response does not produce an unsolicited-message warning.
struct RecentlyCancelled {
    order: VecDeque<RequestId>,
    set: HashSet<RequestId>,
    capacity: usize,
}

impl RecentlyCancelled {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            set: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    fn insert(&mut self, id: RequestId) {
        if self.set.insert(id.clone()) {
            self.order.push_back(id);
            if self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.set.remove(&evicted);
                }
            }
        }
    }

    fn contains(&self, id: &RequestId) -> bool {
        self.set.contains(id)
    }
}

struct HandlerOutput {
    id: RequestId,
    message: Option<JsonRpcMessage>,
}

const HANDLER_OUTPUT_CAPACITY: usize = 16;
const RECENTLY_CANCELLED_CAPACITY: usize = 64;

async fn event_loop<S, T>(
    service: Arc<S>,
    mut transport: T,
    peer: Peer,
    mut peer_rx: mpsc::Receiver<PeerMessage>,
    ct: CancellationToken,
) -> QuitReason
where
    S: Service,
    T: Transport,
{
    let mut pending: HashMap<RequestId, LocalWaiter> = HashMap::new();
    let mut inbound_tasks: HashMap<RequestId, CancellationToken> = HashMap::new();
    let mut recently_cancelled = RecentlyCancelled::new(RECENTLY_CANCELLED_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<HandlerOutput>(HANDLER_OUTPUT_CAPACITY);

    let quit_reason = loop {
        tokio::select! {
            _ = ct.cancelled() => {
                tracing::debug!("session cancelled");
                break QuitReason::Cancelled;
            }
            message = transport.receive() => {
                let Some(message) = message else {
                    tracing::debug!("transport closed");
                    break QuitReason::Closed;
                };
                match message {
                    JsonRpcMessage::Request(request) => {
                        if request.method == PING_METHOD {
                            let pong = JsonRpcMessage::response(request.id, empty_object());
                            if let Err(error) = transport.send(pong).await {
                                tracing::error!(%error, "failed to send ping response");
                                break QuitReason::Closed;
                            }
                        } else {
                            dispatch_request(
                                &service,
                                request,
                                &peer,
                                &ct,
                                &mut inbound_tasks,
                                &outbound_tx,
                            );
                        }
                    }
                    JsonRpcMessage::Notification(notification) => {
                        handle_notification(
                            &service,
                            notification,
                            &peer,
                            &pending,
                            &mut inbound_tasks,
                        );
                    }
                    JsonRpcMessage::Response(response) => {
                        match pending.remove(&response.id) {
                            Some(waiter) => {
                                let _ = waiter.responder.send(Ok(response.result));
                            }
                            None if recently_cancelled.contains(&response.id) => {
                                tracing::debug!(id = %response.id, "late response for cancelled request, dropping");
                            }
                            None => {
                                tracing::warn!(id = %response.id, "unsolicited response, dropping");
                            }
                        }
                    }
                    JsonRpcMessage::Error(error) => {
                        match error.id {
                            Some(id) => match pending.remove(&id) {
                                Some(waiter) => {
                                    let _ = waiter.responder.send(Err(ServiceError::McpError(error.error)));
                                }
                                None if recently_cancelled.contains(&id) => {
                                    tracing::debug!(%id, "late error for cancelled request, dropping");
                                }
                                None => {
                                    tracing::warn!(%id, error = %error.error, "unsolicited error response, dropping");
                                }
                            },
                            None => {
                                tracing::warn!(error = %error.error, "peer reported an unattributed error");
                            }
                        }
                    }
                }
            }
            Some(peer_message) = peer_rx.recv() => {
                match peer_message {
                    PeerMessage::Request { message, id, responder, on_progress } => {
                        match transport.send(message).await {
                            Ok(()) => {
                                pending.insert(id, LocalWaiter {
                                    responder,
                                    on_progress,
                                    cancelling: false,
                                });
                            }
                            Err(error) => {
                                let _ = responder.send(Err(ServiceError::Transport {
                                    error: DynamicTransportError::new(error),
                                    context: "send request".into(),
                                }));
                            }
                        }
                    }
                    PeerMessage::Notification { message, responder } => {
                        let result = transport.send(message).await.map_err(|error| {
                            ServiceError::Transport {
                                error: DynamicTransportError::new(error),
                                context: "send notification".into(),
                            }
                        });
                        let _ = responder.send(result);
                    }
                    PeerMessage::Cancel { id, reason, grace } => {
                        let Some(waiter) = pending.get_mut(&id) else {
                            tracing::debug!(%id, "cancel for unknown or already completed request");
                            continue;
                        };
                        if waiter.cancelling {
                            continue;
                        }
                        waiter.cancelling = true;
                        let params = CancelledNotificationParam {
                            request_id: id.clone(),
                            reason: reason.clone(),
                        };
                        let notification = JsonRpcMessage::notification(
                            CANCELLED_NOTIFICATION_METHOD,
                            serde_json::to_value(params).ok(),
                        );
                        if let Err(error) = transport.send(notification).await {
                            tracing::warn!(%id, %error, "failed to send cancellation notification");
                        }
                        let peer_tx = peer.tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(grace).await;
                            let _ = peer_tx.send(PeerMessage::CancelExpired { id, reason }).await;
                        });
                    }
                    PeerMessage::CancelExpired { id, reason } => {
                        // Completion won the race if the entry is already gone.
                        if let Some(waiter) = pending.remove(&id) {
                            let _ = waiter.responder.send(Err(ServiceError::Cancelled { reason }));
                            recently_cancelled.insert(id);
                        }
                    }
                    PeerMessage::Untrack { id } => {
                        if pending.remove(&id).is_some() {
                            recently_cancelled.insert(id);
                        }
                    }
                }
            }
            Some(output) = outbound_rx.recv() => {
                inbound_tasks.remove(&output.id);
                if let Some(message) = output.message {
                    if let Err(error) = transport.send(message).await {
                        tracing::error!(%error, "failed to send handler result");
                        break QuitReason::Closed;
                    }
                }
            }
        }
    };

    // Teardown: no waiter may be left hanging, and in-flight handlers are
    // told to stop before the loop exits.
    for (_, waiter) in pending.drain() {
        let _ = waiter.responder.send(Err(ServiceError::ConnectionClosed));
    }
    for (_, token) in inbound_tasks.drain() {
        token.cancel();
    }
    if let Err(error) = transport.close().await {
        tracing::warn!(%error, "error closing transport");
    }
    quit_reason
}

fn dispatch_request<S: Service>(
    service: &Arc<S>,
    request: JsonRpcRequest,
    peer: &Peer,
    ct: &CancellationToken,
    inbound_tasks: &mut HashMap<RequestId, CancellationToken>,
    outbound_tx: &mpsc::Sender<HandlerOutput>,
) {
    let task_ct = ct.child_token();
    inbound_tasks.insert(request.id.clone(), task_ct.clone());
    let service = service.clone();
    let peer = peer.clone();
    let outbound_tx = outbound_tx.clone();
    tokio::spawn(async move {
        let id = request.id.clone();
        let context = RequestContext {
            id: id.clone(),
            ct: task_ct.clone(),
            peer,
        };
        let result = service.handle_request(request, context).await;
        if task_ct.is_cancelled() {
            tracing::debug!(%id, "request was cancelled, discarding handler result");
            let _ = outbound_tx
                .send(HandlerOutput { id, message: None })
                .await;
            return;
        }
        let message = match result {
            Ok(value) => JsonRpcMessage::response(id.clone(), value),
            Err(error) => JsonRpcMessage::error(id.clone(), error),
        };
        let _ = outbound_tx
            .send(HandlerOutput {
                id,
                message: Some(message),
            })
            .await;
    });
}

fn handle_notification<S: Service>(
    service: &Arc<S>,
    notification: JsonRpcNotification,
    peer: &Peer,
    pending: &HashMap<RequestId, LocalWaiter>,
    inbound_tasks: &mut HashMap<RequestId, CancellationToken>,
) {
    match notification.method.as_str() {
        CANCELLED_NOTIFICATION_METHOD => {
            let params: CancelledNotificationParam =
                match serde_json::from_value(notification.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(error) => {
                        tracing::warn!(%error, "malformed cancelled notification, ignoring");
                        return;
                    }
                };
            match inbound_tasks.remove(&params.request_id) {
                Some(token) => {
                    tracing::info!(id = %params.request_id, reason = ?params.reason, "peer cancelled in-flight request");
                    token.cancel();
                }
                None => {
                    tracing::debug!(id = %params.request_id, "cancellation for unknown request, ignoring");
                }
            }
        }
        PROGRESS_NOTIFICATION_METHOD => {
            let params: ProgressNotificationParam =
                match serde_json::from_value(notification.params.unwrap_or(Value::Null)) {
                    Ok(params) => params,
                    Err(error) => {
                        tracing::warn!(%error, "malformed progress notification, ignoring");
                        return;
                    }
                };
            let callback = pending
                .get(&params.progress_token)
                .and_then(|waiter| waiter.on_progress.clone());
            match callback {
                Some(callback) => callback(params),
                None => {
                    tracing::debug!(token = %params.progress_token, "progress for unknown request, ignoring");
                }
            }
        }
        _ => {
            let service = service.clone();
            let context = NotificationContext { peer: peer.clone() };
            tokio::spawn(async move {
                service.handle_notification(notification, context).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_param_and_result_errors_are_distinct() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let params = ClientInitializeError::MalformedInitParams(json_error);
        assert!(
            params
                .to_string()
                .starts_with("failed to serialize initialize request params")
        );
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let result = ClientInitializeError::MalformedInitResult(json_error);
        assert!(result.to_string().starts_with("malformed initialize result"));
    }

    #[test]
    fn request_ids_are_monotonic() {
        let provider = AtomicU32RequestIdProvider::default();
        assert_eq!(provider.next_request_id(), RequestId::Number(0));
        assert_eq!(provider.next_request_id(), RequestId::Number(1));
    }

    #[test]
    fn recently_cancelled_evicts_oldest() {
        let mut recent = RecentlyCancelled::new(2);
        recent.insert(RequestId::Number(1));
        recent.insert(RequestId::Number(2));
        recent.insert(RequestId::Number(3));
        assert!(!recent.contains(&RequestId::Number(1)));
        assert!(recent.contains(&RequestId::Number(2)));
        assert!(recent.contains(&RequestId::Number(3)));
    }

    #[test]
    fn progress_token_injection_preserves_params() {
        let params = serde_json::json!({"name": "slow"});
        let injected = inject_progress_token(Some(params), &RequestId::Number(7));
        assert_eq!(injected["name"], "slow");
        assert_eq!(injected["_meta"]["progressToken"], 7);
    }
}
