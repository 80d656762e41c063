use std::io;

use thiserror::Error;

/// Classification of a local filesystem failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LocalIoKind {
    NotFound,
    PermissionDenied,
    OutOfSpace,
    Other,
}

#[derive(Debug, Error)]
#[error("local i/o error ({kind:?}): {message}")]
pub struct LocalIoError {
    pub kind: LocalIoKind,
    pub message: String,
}

impl LocalIoError {
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: LocalIoKind::Other,
            message: message.into(),
        }
    }
}

impl From<io::Error> for LocalIoError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => LocalIoKind::NotFound,
            io::ErrorKind::PermissionDenied => LocalIoKind::PermissionDenied,
            io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => LocalIoKind::OutOfSpace,
            _ => LocalIoKind::Other,
        };
        Self {
            kind,
            message: e.to_string(),
        }
    }
}

/// Failure reported by a remote storage adapter.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote object not found: {0}")]
    NotFound(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("remote error: {0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    LocalIo(#[from] LocalIoError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("database error: {0}")]
    Database(String),
    #[error("attachment not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("cancelled")]
    Cancelled,
    #[error("transaction callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Database(e.to_string())
    }
}
