//! Crate-level error type unifying the per-layer errors.

use thiserror::Error;

use crate::service::{ClientInitializeError, ServerInitializeError, ServiceError};

/// Single error type callers can funnel everything into when they do not care
/// which layer failed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("client initialization error: {0}")]
    ClientInitialize(#[from] ClientInitializeError),

    #[error("server initialization error: {0}")]
    ServerInitialize(#[from] ServerInitializeError),

    #[error("service error: {0}")]
    Service(#[from] ServiceError),

    #[error("session task error: {0}")]
    Join(#[from] tokio::task::JoinError),
}
