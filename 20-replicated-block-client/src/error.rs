//! Error types for the block client.
//!
//! Callers of a [`Session`](crate::session::Session) meet three kinds of
//! failure:
//!
//! - [`SessionError`]: a submission or control call could not be carried out
//!   (bad arguments, transport failure, teardown with requests in flight).
//! - [`RequestError`]: the status handed to a completion. This is how the
//!   outcome of an individual read or write reaches the caller.
//! - [`DispatchError`]: an inbound frame was dropped by the dispatcher. The
//!   session keeps running; the error is returned so the transport loop can
//!   log or count it.

use std::io;

use thiserror::Error;

use crate::protocol::CommandCode;
use crate::request::RequestId;

/// Status code reported for local failures that have no remote code.
pub const EIO: i32 = -5;

/// Status code reported for requests rejected before reaching the wire.
pub const EINVAL: i32 = -22;

/// Failures while encoding or decoding command frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown command code {0}")]
    UnknownCommand(u32),

    #[error("payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("truncated payload: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("negative sector count {0} in control block")]
    NegativeSectorCount(i32),

    #[error(transparent)]
    Codec(#[from] bincode::Error),
}

/// Completion status for a single read or write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// The backend answered with a negative payload length.
    #[error("backend reported failure {code}")]
    Remote { code: i32 },

    /// The response payload did not match the requested sector range and the
    /// session runs with [`LengthPolicy::Strict`](crate::config::LengthPolicy).
    #[error("expected {expected} payload bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// The backend answered a read with a different command.
    #[error("backend answered with {command:?}")]
    UnexpectedResponse { command: CommandCode },

    /// The request never made it onto the wire.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The request was rejected locally before anything was sent.
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl RequestError {
    /// Negative status code suitable for a block layer completion.
    pub fn code(&self) -> i32 {
        match self {
            RequestError::Remote { code } => *code,
            RequestError::LengthMismatch { .. }
            | RequestError::UnexpectedResponse { .. }
            | RequestError::Transport(_) => EIO,
            RequestError::Invalid(_) => EINVAL,
        }
    }
}

impl From<&SessionError> for RequestError {
    fn from(err: &SessionError) -> Self {
        match err {
            SessionError::Io(_) | SessionError::Disconnected => {
                RequestError::Transport(err.to_string())
            }
            SessionError::Request(inner) => inner.clone(),
            other => RequestError::Invalid(other.to_string()),
        }
    }
}

/// Result handed to every completion callback.
pub type CompletionResult = std::result::Result<(), RequestError>;

/// Errors returned by session calls.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("transport i/o failed")]
    Io(#[from] io::Error),

    #[error("failed to encode frame")]
    Encode(#[from] bincode::Error),

    #[error("write batch is empty")]
    EmptyBatch,

    #[error("write buffer of {len} bytes is not a positive multiple of the sector size")]
    UnalignedWrite { len: usize },

    #[error("buffer holds {len} bytes but {needed} are needed")]
    BufferTooSmall { len: usize, needed: usize },

    #[error("invalid sector count {0}")]
    InvalidSectorCount(i32),

    #[error("frame payload of {0} bytes does not fit the header")]
    PayloadTooLarge(usize),

    #[error("request id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("{} request(s) still pending: {ids:?}", .ids.len())]
    OutstandingRequests { ids: Vec<RequestId> },

    #[error("synchronous wait attempted from inside the response dispatcher")]
    ReentrantWait,

    #[error("event loop disconnected before the response arrived")]
    Disconnected,

    #[error("request failed: {0}")]
    Request(#[from] RequestError),

    #[error("inbound stream is corrupt")]
    Protocol(#[from] ProtocolError),
}

/// Reasons an inbound frame was dropped.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no pending request with id {0}")]
    UnknownRequest(RequestId),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
