//! In-process session store for the streamable HTTP server.
//!
//! Each session runs a worker task that owns the message routing state:
//! which SSE stream each outbound message belongs to, the per-stream event
//! log used for resumption, and the channel pair connecting the HTTP side to
//! the service running on top.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use futures::Stream;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    model::{JsonRpcMessage, RequestId},
    transport::{
        Transport,
        common::{SessionId, session_id},
    },
};

/// One frame bound for a client event stream; `event_id` is what a client
/// echoes back in `Last-Event-ID` to resume.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: Arc<JsonRpcMessage>,
}

/// Storage and routing for server sessions. The HTTP handlers speak to
/// sessions exclusively through this trait, so alternative backings can be
/// plugged in.
pub trait SessionManager: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transport: Transport + 'static;

    /// Open a session, returning its id and the transport the service side
    /// will be served over.
    fn create_session(
        &self,
    ) -> impl Future<Output = Result<(SessionId, Self::Transport), Self::Error>> + Send;

    /// Feed the `initialize` request through the session and wait for the
    /// handshake response.
    fn initialize_session(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<JsonRpcMessage, Self::Error>> + Send;

    fn has_session(&self, id: &SessionId) -> impl Future<Output = Result<bool, Self::Error>> + Send;

    fn close_session(&self, id: &SessionId)
    -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Accept a request and open the event stream its response will arrive
    /// on. The stream ends once the response has been delivered.
    fn create_stream(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Open the stream carrying server-initiated messages.
    fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Re-open a stream after `last_event_id`, replaying everything logged
    /// since. Fails explicitly when the requested position has been evicted.
    fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> impl Future<
        Output = Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error>,
    > + Send;

    /// Accept a notification or a client response; nothing streams back.
    fn accept_message(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session worker is gone")]
    SessionClosed,
    #[error("session service terminated")]
    ServiceTerminated,
    #[error("invalid event id: {0}")]
    InvalidEventId(String),
    #[error("events since {event_id} have been evicted")]
    EventEvicted { event_id: String },
    #[error("expected a request message")]
    ExpectedRequest,
    #[error("unexpected initialize response: {0:?}")]
    UnexpectedInitializeResponse(Option<JsonRpcMessage>),
}

#[derive(Debug, Error)]
pub enum LocalSessionManagerError {
    #[error("session not found")]
    SessionNotFound,
    #[error(transparent)]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of every channel inside a session. Must be at least 1; a
    /// rendezvous channel here would deadlock the routing worker.
    pub channel_capacity: usize,
    /// Events retained per stream for resumption.
    pub event_retention: usize,
    /// Reap a session after this long without any traffic.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            event_retention: 256,
            idle_timeout: None,
        }
    }
}

const COMMON_STREAM_ID: u64 = 0;

fn format_event_id(stream_id: u64, index: u64) -> String {
    format!("{stream_id}/{index}")
}

fn parse_event_id(event_id: &str) -> Result<(u64, u64), SessionError> {
    let invalid = || SessionError::InvalidEventId(event_id.to_string());
    let (stream, index) = event_id.split_once('/').ok_or_else(invalid)?;
    let stream = stream.parse().map_err(|_| invalid())?;
    let index = index.parse().map_err(|_| invalid())?;
    Ok((stream, index))
}

struct StreamEntry {
    stream_id: u64,
    tx: Option<mpsc::Sender<ServerSseMessage>>,
    /// Contiguous tail of the event history: back index is `next_index - 1`.
    log: VecDeque<(u64, Arc<JsonRpcMessage>)>,
    next_index: u64,
    /// Set once the stream's response went out; a finished stream only ever
    /// replays, it never tails.
    finished: bool,
    retention: usize,
}

impl StreamEntry {
    fn new(stream_id: u64, retention: usize) -> Self {
        Self {
            stream_id,
            tx: None,
            log: VecDeque::new(),
            next_index: 0,
            finished: false,
            retention: retention.max(1),
        }
    }

    fn append(&mut self, message: Arc<JsonRpcMessage>) -> ServerSseMessage {
        let index = self.next_index;
        self.next_index += 1;
        self.log.push_back((index, message.clone()));
        while self.log.len() > self.retention {
            self.log.pop_front();
        }
        ServerSseMessage {
            event_id: Some(format_event_id(self.stream_id, index)),
            message,
        }
    }

    /// Events strictly after `index`, an invalid-id error when `index` names
    /// an event this stream never emitted, or an eviction error when the log
    /// no longer reaches back that far.
    fn replay_after(&self, index: u64) -> Result<Vec<ServerSseMessage>, SessionError> {
        if index >= self.next_index {
            return Err(SessionError::InvalidEventId(format_event_id(
                self.stream_id,
                index,
            )));
        }
        let resume_from = index + 1;
        if resume_from < self.next_index {
            let first_kept = match self.log.front() {
                Some((first, _)) => *first,
                None => self.next_index,
            };
            if resume_from < first_kept {
                return Err(SessionError::EventEvicted {
                    event_id: format_event_id(self.stream_id, index),
                });
            }
        }
        Ok(self
            .log
            .iter()
            .filter(|(i, _)| *i > index)
            .map(|(i, message)| ServerSseMessage {
                event_id: Some(format_event_id(self.stream_id, *i)),
                message: message.clone(),
            })
            .collect())
    }
}

enum SessionEvent {
    Initialize {
        message: JsonRpcMessage,
        responder: oneshot::Sender<Result<JsonRpcMessage, SessionError>>,
    },
    CreateStream {
        message: JsonRpcMessage,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    CreateStandaloneStream {
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    Resume {
        last_event_id: String,
        responder: oneshot::Sender<Result<ReceiverStream<ServerSseMessage>, SessionError>>,
    },
    AcceptMessage {
        message: JsonRpcMessage,
        responder: oneshot::Sender<Result<(), SessionError>>,
    },
}

/// The transport handed to `serve_server` for one HTTP session.
pub struct SessionTransport {
    to_worker: mpsc::Sender<JsonRpcMessage>,
    from_worker: mpsc::Receiver<JsonRpcMessage>,
    closed: bool,
}

#[derive(Debug, Error)]
#[error("http session closed")]
pub struct SessionTransportClosed;

impl Transport for SessionTransport {
    type Error = SessionTransportClosed;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        if self.closed {
            return Err(SessionTransportClosed);
        }
        self.to_worker
            .send(item)
            .await
            .map_err(|_| SessionTransportClosed)
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        if self.closed {
            return None;
        }
        self.from_worker.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.closed = true;
        self.from_worker.close();
        Ok(())
    }
}

struct SessionHandle {
    event_tx: mpsc::Sender<SessionEvent>,
    ct: CancellationToken,
}

type SessionMap = Arc<RwLock<HashMap<SessionId, SessionHandle>>>;

/// [`SessionManager`] keeping every session on the local task set.
pub struct LocalSessionManager {
    sessions: SessionMap,
    config: SessionConfig,
}

impl Default for LocalSessionManager {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl LocalSessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: Default::default(),
            config,
        }
    }

    async fn send_event(
        &self,
        id: &SessionId,
        event: SessionEvent,
    ) -> Result<(), LocalSessionManagerError> {
        let sessions = self.sessions.read().await;
        let handle = sessions
            .get(id)
            .ok_or(LocalSessionManagerError::SessionNotFound)?;
        handle
            .event_tx
            .send(event)
            .await
            .map_err(|_| SessionError::SessionClosed.into())
    }
}

impl SessionManager for LocalSessionManager {
    type Error = LocalSessionManagerError;
    type Transport = SessionTransport;

    async fn create_session(&self) -> Result<(SessionId, SessionTransport), Self::Error> {
        let id = session_id();
        let capacity = self.config.channel_capacity.max(1);
        let (to_service_tx, to_service_rx) = mpsc::channel(capacity);
        let (from_service_tx, from_service_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let ct = CancellationToken::new();
        let worker = SessionWorker {
            session_id: id.clone(),
            config: self.config.clone(),
            to_service_tx,
            from_service_rx,
            event_rx,
            ct: ct.clone(),
            streams: HashMap::new(),
            request_routes: HashMap::new(),
            next_stream_id: COMMON_STREAM_ID + 1,
            init: None,
        };
        self.sessions
            .write()
            .await
            .insert(id.clone(), SessionHandle { event_tx, ct });
        tokio::spawn(worker.run(self.sessions.clone()));
        let transport = SessionTransport {
            to_worker: from_service_tx,
            from_worker: to_service_rx,
            closed: false,
        };
        Ok((id, transport))
    }

    async fn initialize_session(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<JsonRpcMessage, Self::Error> {
        let (responder, rx) = oneshot::channel();
        self.send_event(id, SessionEvent::Initialize { message, responder })
            .await?;
        let response = rx.await.map_err(|_| SessionError::SessionClosed)??;
        Ok(response)
    }

    async fn has_session(&self, id: &SessionId) -> Result<bool, Self::Error> {
        Ok(self.sessions.read().await.contains_key(id))
    }

    async fn close_session(&self, id: &SessionId) -> Result<(), Self::Error> {
        let handle = self.sessions.write().await.remove(id);
        match handle {
            Some(handle) => {
                handle.ct.cancel();
                Ok(())
            }
            None => Err(LocalSessionManagerError::SessionNotFound),
        }
    }

    async fn create_stream(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error> {
        let (responder, rx) = oneshot::channel();
        self.send_event(id, SessionEvent::CreateStream { message, responder })
            .await?;
        let stream = rx.await.map_err(|_| SessionError::SessionClosed)??;
        Ok(stream)
    }

    async fn create_standalone_stream(
        &self,
        id: &SessionId,
    ) -> Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error> {
        let (responder, rx) = oneshot::channel();
        self.send_event(id, SessionEvent::CreateStandaloneStream { responder })
            .await?;
        let stream = rx.await.map_err(|_| SessionError::SessionClosed)??;
        Ok(stream)
    }

    async fn resume(
        &self,
        id: &SessionId,
        last_event_id: String,
    ) -> Result<impl Stream<Item = ServerSseMessage> + Send + 'static, Self::Error> {
        let (responder, rx) = oneshot::channel();
        self.send_event(
            id,
            SessionEvent::Resume {
                last_event_id,
                responder,
            },
        )
        .await?;
        let stream = rx.await.map_err(|_| SessionError::SessionClosed)??;
        Ok(stream)
    }

    async fn accept_message(
        &self,
        id: &SessionId,
        message: JsonRpcMessage,
    ) -> Result<(), Self::Error> {
        let (responder, rx) = oneshot::channel();
        self.send_event(id, SessionEvent::AcceptMessage { message, responder })
            .await?;
        rx.await.map_err(|_| SessionError::SessionClosed)??;
        Ok(())
    }
}

struct SessionWorker {
    session_id: SessionId,
    config: SessionConfig,
    to_service_tx: mpsc::Sender<JsonRpcMessage>,
    from_service_rx: mpsc::Receiver<JsonRpcMessage>,
    event_rx: mpsc::Receiver<SessionEvent>,
    ct: CancellationToken,
    streams: HashMap<u64, StreamEntry>,
    request_routes: HashMap<RequestId, u64>,
    next_stream_id: u64,
    init: Option<(RequestId, oneshot::Sender<Result<JsonRpcMessage, SessionError>>)>,
}

impl SessionWorker {
    async fn run(mut self, sessions: SessionMap) {
        self.streams.insert(
            COMMON_STREAM_ID,
            StreamEntry::new(COMMON_STREAM_ID, self.config.event_retention),
        );
        let idle_timeout = self.config.idle_timeout;
        loop {
            let idle = async {
                match idle_timeout {
                    Some(timeout) => tokio::time::sleep(timeout).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = self.ct.cancelled() => {
                    tracing::debug!(session_id = %self.session_id, "session cancelled");
                    break;
                }
                _ = idle => {
                    tracing::info!(session_id = %self.session_id, "session idle timeout");
                    break;
                }
                event = self.event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event).await;
                }
                outbound = self.from_service_rx.recv() => {
                    let Some(message) = outbound else {
                        tracing::debug!(session_id = %self.session_id, "service terminated");
                        break;
                    };
                    self.route_outbound(message).await;
                }
            }
        }
        sessions.write().await.remove(&self.session_id);
        tracing::debug!(session_id = %self.session_id, "session closed");
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Initialize { message, responder } => {
                let Some(id) = message.request_id().cloned() else {
                    let _ = responder.send(Err(SessionError::ExpectedRequest));
                    return;
                };
                if self.to_service_tx.send(message).await.is_err() {
                    let _ = responder.send(Err(SessionError::ServiceTerminated));
                    return;
                }
                self.init = Some((id, responder));
            }
            SessionEvent::CreateStream { message, responder } => {
                let Some(id) = message.request_id().cloned() else {
                    let _ = responder.send(Err(SessionError::ExpectedRequest));
                    return;
                };
                if self.to_service_tx.send(message).await.is_err() {
                    let _ = responder.send(Err(SessionError::ServiceTerminated));
                    return;
                }
                let stream_id = self.next_stream_id;
                self.next_stream_id += 1;
                let mut entry = StreamEntry::new(stream_id, self.config.event_retention);
                let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
                entry.tx = Some(tx);
                self.streams.insert(stream_id, entry);
                self.request_routes.insert(id, stream_id);
                let _ = responder.send(Ok(ReceiverStream::new(rx)));
            }
            SessionEvent::CreateStandaloneStream { responder } => {
                let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
                if let Some(entry) = self.streams.get_mut(&COMMON_STREAM_ID) {
                    entry.tx = Some(tx);
                }
                let _ = responder.send(Ok(ReceiverStream::new(rx)));
            }
            SessionEvent::Resume {
                last_event_id,
                responder,
            } => {
                let _ = responder.send(self.resume_stream(&last_event_id));
            }
            SessionEvent::AcceptMessage { message, responder } => {
                let result = self
                    .to_service_tx
                    .send(message)
                    .await
                    .map_err(|_| SessionError::ServiceTerminated);
                let _ = responder.send(result);
            }
        }
    }

    fn resume_stream(
        &mut self,
        last_event_id: &str,
    ) -> Result<ReceiverStream<ServerSseMessage>, SessionError> {
        let (stream_id, index) = parse_event_id(last_event_id)?;
        let entry = self
            .streams
            .get_mut(&stream_id)
            .ok_or_else(|| SessionError::InvalidEventId(last_event_id.to_string()))?;
        let replay = entry.replay_after(index)?;
        let capacity = (replay.len() + 1).max(self.config.channel_capacity);
        let (tx, rx) = mpsc::channel(capacity);
        for event in replay {
            // Capacity covers the whole replay, so this cannot fail.
            let _ = tx.try_send(event);
        }
        if !entry.finished {
            entry.tx = Some(tx);
        }
        Ok(ReceiverStream::new(rx))
    }

    async fn route_outbound(&mut self, message: JsonRpcMessage) {
        enum Route {
            Reply(RequestId),
            Stream(u64),
        }
        let message = Arc::new(message);
        let route = match message.as_ref() {
            JsonRpcMessage::Response(response) => Route::Reply(response.id.clone()),
            JsonRpcMessage::Error(error) => match &error.id {
                Some(id) => Route::Reply(id.clone()),
                None => Route::Stream(COMMON_STREAM_ID),
            },
            JsonRpcMessage::Notification(notification) => {
                let stream_id = correlated_request_id(notification.params.as_ref())
                    .and_then(|id| self.request_routes.get(&id).copied())
                    .unwrap_or(COMMON_STREAM_ID);
                Route::Stream(stream_id)
            }
            JsonRpcMessage::Request(_) => Route::Stream(COMMON_STREAM_ID),
        };
        match route {
            Route::Reply(id) => self.route_reply(&id, message).await,
            Route::Stream(stream_id) => self.deliver(stream_id, message, false).await,
        }
    }

    async fn route_reply(&mut self, id: &RequestId, message: Arc<JsonRpcMessage>) {
        if let Some((init_id, _)) = &self.init {
            if init_id == id {
                if let Some((_, responder)) = self.init.take() {
                    let _ = responder.send(Ok(message.as_ref().clone()));
                }
                return;
            }
        }
        match self.request_routes.remove(id) {
            Some(stream_id) => self.deliver(stream_id, message, true).await,
            None => {
                tracing::warn!(session_id = %self.session_id, %id, "reply without a stream, routing to common");
                self.deliver(COMMON_STREAM_ID, message, false).await;
            }
        }
    }

    async fn deliver(&mut self, stream_id: u64, message: Arc<JsonRpcMessage>, finish: bool) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            tracing::warn!(session_id = %self.session_id, stream_id, "dropping message for unknown stream");
            return;
        };
        let event = entry.append(message);
        if let Some(tx) = &entry.tx {
            if tx.send(event).await.is_err() {
                // Client is gone; keep logging so it can resume.
                entry.tx = None;
            }
        }
        if finish {
            entry.finished = true;
            entry.tx = None;
        }
    }
}

/// Progress and cancellation notifications carry the request they belong to;
/// route them onto that request's stream.
fn correlated_request_id(params: Option<&serde_json::Value>) -> Option<RequestId> {
    let params = params?;
    let token = params
        .get("progressToken")
        .or_else(|| params.get("requestId"))?;
    match token {
        serde_json::Value::Number(n) => n.as_u64().map(|n| RequestId::Number(n as u32)),
        serde_json::Value::String(s) => Some(RequestId::String(s.as_str().into())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_round_trip() {
        let id = format_event_id(3, 41);
        assert_eq!(parse_event_id(&id).unwrap(), (3, 41));
        assert!(parse_event_id("garbage").is_err());
        assert!(parse_event_id("1/x").is_err());
    }

    #[test]
    fn replay_is_gap_free_or_fails() {
        let mut entry = StreamEntry::new(1, 3);
        for i in 0..6u64 {
            let message = Arc::new(JsonRpcMessage::notification(format!("n{i}"), None));
            entry.append(message);
        }
        // log now holds indices 3..=5
        let replay = entry.replay_after(3).unwrap();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].event_id.as_deref(), Some("1/4"));
        assert_eq!(replay[1].event_id.as_deref(), Some("1/5"));

        // index 1 would require evicted events 2 and 3
        assert!(matches!(
            entry.replay_after(1),
            Err(SessionError::EventEvicted { .. })
        ));

        // caught up: nothing to replay
        assert!(entry.replay_after(5).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_ids_never_emitted() {
        let mut entry = StreamEntry::new(0, 8);
        for i in 0..3u64 {
            let message = Arc::new(JsonRpcMessage::notification(format!("n{i}"), None));
            entry.append(message);
        }
        // 0/2 is the newest emitted event; anything past it is bogus
        assert!(matches!(
            entry.replay_after(3),
            Err(SessionError::InvalidEventId(_))
        ));
        assert!(matches!(
            entry.replay_after(99),
            Err(SessionError::InvalidEventId(_))
        ));
        // a stream that emitted nothing has no resumable ids at all
        let empty = StreamEntry::new(7, 8);
        assert!(matches!(
            empty.replay_after(0),
            Err(SessionError::InvalidEventId(_))
        ));
    }
}
