use crate::envelope::ErrorCode;
use thiserror::Error;

/// Errors that can occur while serving hub connections.
#[derive(Error, Debug)]
pub enum HubError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was rejected before, at, or after admission.
    #[error("rejected: {0}")]
    Rejected(ErrorCode),
}
