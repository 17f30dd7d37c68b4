use thiserror::Error;

use crate::client::binary::BinStatus;

/// Errors surfaced by the protocol codecs and the load engine.
///
/// Connection- and framing-level failures are fatal to the worker that hit
/// them and abort the run. Cache-semantic outcomes (misses, delete-not-found,
/// validation mismatches) are never errors; they land in [`crate::Stats`].
#[derive(Error, Debug)]
pub enum McError {
    #[error("key is too long")]
    KeyTooLong,

    #[error("corrupt value in response")]
    CorruptValue,

    #[error("unknown status code in response")]
    UnknownStatus,

    #[error("response key does not match request key")]
    KeyMismatch,

    #[error("unexpected response from server")]
    UnexpectedResponse,

    #[error("SERVER_ERROR received")]
    ServerError,

    /// Non-zero status in a binary-protocol response header.
    #[error("{0}")]
    Status(BinStatus),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("worker task failed: {0}")]
    TaskFailed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, McError>;
