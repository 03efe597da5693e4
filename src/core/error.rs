use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by the queue core and its collaborators.
#[derive(Debug, Error)]
pub enum QueueError {
    /// No such queue, handle or ack-tag. Surfaced to the caller, never retried.
    #[error("not found")]
    NotFound,

    /// Exclusive consumer conflict.
    #[error("exclusive consumer in use")]
    InUse,

    #[error("handle not open for reading: {0}")]
    NotOpenForReading(PathBuf),

    #[error("handle not open for writing: {0}")]
    NotOpenForWriting(PathBuf),

    /// A second writer was opened against a path that already has one.
    #[error("writer already exists for {0}")]
    WriterExists(PathBuf),

    /// The peer actor died mid-call.
    #[error("peer exited during call")]
    PeerExit,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueueError>;
