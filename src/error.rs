use std::io;

use thiserror::Error;

/// The error taxonomy of the query engine.
///
/// Every submitted request resolves its completion handle with exactly one
/// value - either a typed response or one of these errors. The dispatch loop
/// itself never dies on a single request's failure.
#[derive(Debug, Error)]
pub enum QueryError {
    /// bind / send / receive OS error, or the socket / connection was closed
    #[error("transport error: {0}")]
    Transport(String),

    /// the request could not be serialized
    #[error("request could not be encoded: {0}")]
    Encoding(String),

    /// inbound bytes could not be decoded into a message of the expected family
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// a structurally valid frame with a discriminator no decoder claims
    #[error("unrecognized message of {} bytes", .raw.len())]
    UnrecognizedMessage { raw: Vec<u8> },

    #[error("packet size {actual} exceeds the limit of {limit} bytes")]
    PacketSizeLimitExceeded { limit: usize, actual: usize },

    /// the deadline passed without a matching response
    #[error("request timed out")]
    RequestTimedOut,

    /// a live session with the same key already exists
    #[error("duplicate session for {0}")]
    DuplicateSession(String),

    #[error("rcon authentication refused by the server")]
    AuthenticationFailed,

    #[error("request was cancelled")]
    Cancelled,
}

impl From<io::Error> for QueryError {
    fn from(e: io::Error) -> QueryError {
        QueryError::Transport(e.to_string())
    }
}

impl From<bytes::TryGetError> for QueryError {
    fn from(e: bytes::TryGetError) -> QueryError {
        QueryError::MalformedPayload(e.to_string())
    }
}
