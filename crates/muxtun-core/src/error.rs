//! Engine error types

use muxtun_proto::CodecError;
use thiserror::Error;

/// Errors produced by the tunnel engine
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("bad configuration: {0}")]
    BadConfiguration(String),

    #[error("bad connection: {0}")]
    BadConnection(String),

    #[error("bad frame: {0}")]
    BadFrame(#[from] CodecError),

    #[error("transport IO error: {0}")]
    TransportIo(#[from] std::io::Error),

    #[error("remote host refused the connection")]
    RemoteRefused,

    #[error("remote host unreachable")]
    RemoteUnreachable,

    #[error("operation timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations
pub type TunnelResult<T> = Result<T, TunnelError>;
