use thiserror::Error;

/// Connection failures. `Clone` because one in-flight attempt's outcome is
/// handed to every caller waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("gave up after {0} reconnect attempts")]
    Exhausted(u32),
    #[error("connection closed before it opened")]
    Cancelled,
    #[error("socket is not open")]
    NotOpen,
    #[error("failed to encode message: {0}")]
    Encode(String),
}
