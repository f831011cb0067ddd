//! Streaming JSON-RPC session and transport layer.
//!
//! The crate is split along the protocol's own seams:
//!
//! * [`model`] is the wire format: the JSON-RPC 2.0 message envelope, one
//!   message per frame, no batching.
//! * [`transport`] moves framed messages over a duplex channel: stdio, child
//!   processes, HTTP+SSE and streamable HTTP.
//! * [`service`] is the session engine on top: request/response correlation,
//!   per-method dispatch, progress forwarding and cooperative cancellation.
//!
//! A client session is three calls end to end:
//!
//! ```rust,no_run
//! use mcpio::{
//!     model::InitializeRequestParam,
//!     service::serve_client,
//!     transport::TokioChildProcess,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let transport = TokioChildProcess::new(tokio::process::Command::new("my-server"))?;
//! let running = serve_client((), transport, InitializeRequestParam::default()).await?;
//! let pong = running.peer().send_request("ping", None).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod model;
pub mod service;
pub mod transport;

pub use error::Error;
pub use model::{JsonRpcMessage, RequestId};
pub use service::{
    Peer, Router, RunningService, Service, ServiceError, serve_client, serve_server,
};
pub use transport::{IntoTransport, Transport};
