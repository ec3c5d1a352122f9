/// Transport-level failures. No retries happen at this layer; reconnection
/// is left to the caller with a fresh [`crate::ConnectionManager`].
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("connection closed")]
    Closed,

    #[error("connection manager already used; construct a fresh instance")]
    Reused,
}
