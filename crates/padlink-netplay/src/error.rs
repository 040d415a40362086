//! Client error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] padlink_proto::ProtoError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netplay reactor is gone")]
    ReactorGone,
}
