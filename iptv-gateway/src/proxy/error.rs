use thiserror::Error;

use crate::domain::BridgeUnavailable;

/// Reasons a playback request is refused.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("missing or invalid viewer token")]
    Unauthorized,

    #[error("channel {0} not found")]
    NotFound(i64),

    #[error("channel {0} is not active")]
    Forbidden(i64),

    #[error(transparent)]
    Unavailable(#[from] BridgeUnavailable),

    #[error("upstream unavailable: {0}")]
    BadGateway(String),

    #[error(transparent)]
    Internal(#[from] crate::Error),
}
