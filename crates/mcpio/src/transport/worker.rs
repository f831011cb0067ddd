//! Run a transport state machine on its own task.
//!
//! The HTTP-based client transports juggle several connections at once, so
//! they cannot live inside `send`/`receive` calls directly. A [`Worker`] owns
//! that state machine; [`WorkerTransport`] bridges it back to the [`Transport`]
//! contract over a pair of channels.

use std::borrow::Cow;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    model::JsonRpcMessage,
    transport::{DynamicTransportError, Transport},
};

#[derive(Debug, Error)]
pub enum WorkerQuitReason {
    #[error("worker cancelled")]
    Cancelled,
    #[error("remote endpoint closed")]
    TransportClosed,
    #[error("session handler terminated")]
    HandlerTerminated,
    #[error("fatal error {error}, when {context}")]
    Fatal {
        error: DynamicTransportError,
        context: Cow<'static, str>,
    },
}

impl WorkerQuitReason {
    pub fn fatal<E: std::error::Error + Send + Sync + 'static>(
        error: E,
        context: &'static str,
    ) -> Self {
        Self::Fatal {
            error: DynamicTransportError::new(error),
            context: Cow::Borrowed(context),
        }
    }

    pub fn fatal_context<E: std::error::Error + Send + Sync + 'static>(
        context: &'static str,
    ) -> impl FnOnce(E) -> Self {
        move |error| Self::fatal(error, context)
    }
}

pub trait Worker: Sized + Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn err_closed() -> Self::Error;
    fn err_join(error: tokio::task::JoinError) -> Self::Error;

    fn config(&self) -> WorkerConfig {
        WorkerConfig::default()
    }

    fn run(
        self,
        context: WorkerContext<Self>,
    ) -> impl Future<Output = Result<(), WorkerQuitReason>> + Send;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub name: Option<String>,
    pub channel_buffer_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: None,
            channel_buffer_capacity: 16,
        }
    }
}

/// An outbound message paired with a channel for reporting delivery.
pub struct WorkerSendRequest<W: Worker> {
    pub message: JsonRpcMessage,
    pub responder: oneshot::Sender<Result<(), W::Error>>,
}

pub struct WorkerContext<W: Worker> {
    to_handler_tx: mpsc::Sender<JsonRpcMessage>,
    from_handler_rx: mpsc::Receiver<WorkerSendRequest<W>>,
    pub cancellation_token: CancellationToken,
}

impl<W: Worker> WorkerContext<W> {
    /// Deliver an inbound message to the session. Fails with
    /// [`WorkerQuitReason::HandlerTerminated`] once the session is gone.
    pub async fn send_to_handler(&self, message: JsonRpcMessage) -> Result<(), WorkerQuitReason> {
        self.to_handler_tx
            .send(message)
            .await
            .map_err(|_| WorkerQuitReason::HandlerTerminated)
    }

    /// A cloneable handle for feeding inbound messages from auxiliary tasks.
    pub fn handler_sender(&self) -> mpsc::Sender<JsonRpcMessage> {
        self.to_handler_tx.clone()
    }

    /// Next outbound message from the session, or
    /// [`WorkerQuitReason::HandlerTerminated`] once the session is gone.
    pub async fn recv_from_handler(&mut self) -> Result<WorkerSendRequest<W>, WorkerQuitReason> {
        self.from_handler_rx
            .recv()
            .await
            .ok_or(WorkerQuitReason::HandlerTerminated)
    }
}

pub struct WorkerTransport<W: Worker> {
    rx: mpsc::Receiver<JsonRpcMessage>,
    send_tx: mpsc::Sender<WorkerSendRequest<W>>,
    join_handle: Option<tokio::task::JoinHandle<Result<(), WorkerQuitReason>>>,
    ct: CancellationToken,
}

impl<W: Worker> WorkerTransport<W> {
    pub fn spawn(worker: W) -> Self {
        Self::spawn_with_ct(worker, CancellationToken::new())
    }

    pub fn spawn_with_ct(worker: W, ct: CancellationToken) -> Self {
        let config = worker.config();
        let capacity = config.channel_buffer_capacity.max(1);
        let (to_handler_tx, rx) = mpsc::channel(capacity);
        let (send_tx, from_handler_rx) = mpsc::channel(capacity);
        let context = WorkerContext {
            to_handler_tx,
            from_handler_rx,
            cancellation_token: ct.clone(),
        };
        let worker_name = config.name.unwrap_or_else(|| "transport-worker".into());
        let join_handle = tokio::spawn(async move {
            let result = worker.run(context).await;
            match &result {
                Ok(()) | Err(WorkerQuitReason::Cancelled) => {
                    tracing::debug!(name = %worker_name, "worker quit")
                }
                Err(reason) => tracing::warn!(name = %worker_name, %reason, "worker quit"),
            }
            result
        });
        Self {
            rx,
            send_tx,
            join_handle: Some(join_handle),
            ct,
        }
    }
}

impl<W: Worker> Transport for WorkerTransport<W> {
    type Error = W::Error;

    async fn send(&mut self, item: JsonRpcMessage) -> Result<(), Self::Error> {
        let (responder, receiver) = oneshot::channel();
        self.send_tx
            .send(WorkerSendRequest {
                message: item,
                responder,
            })
            .await
            .map_err(|_| W::err_closed())?;
        receiver.await.map_err(|_| W::err_closed())?
    }

    async fn receive(&mut self) -> Option<JsonRpcMessage> {
        self.rx.recv().await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.ct.cancel();
        let Some(handle) = self.join_handle.take() else {
            return Ok(());
        };
        let quit = handle.await.map_err(W::err_join)?;
        if let Err(reason) = quit {
            tracing::debug!(%reason, "worker quit on close");
        }
        Ok(())
    }
}
