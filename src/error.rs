use std::fmt;

/// Errors surfaced across the public API of this crate.
///
/// Fatal variants (see [`Error::is_fatal`]) terminate the connection actor that produced them;
/// the rest are per-request failures returned to a single caller without affecting the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to connect: {0}")]
    ConnectionFailure(#[source] std::io::Error),

    #[error("failed to upgrade to TLS: {0}")]
    FailedToUpgradeToTls(#[source] std::io::Error),

    #[error("SASL authentication failed: {0}")]
    SaslAuthError(String),

    #[error("failed to write to socket: {0}")]
    SendError(#[source] std::io::Error),

    #[error("transport closed by peer ({0})")]
    TransportClosed(TransportCloseReason),

    #[error("transport error: {0}")]
    TransportError(#[source] std::io::Error),

    #[error("timed out waiting for a response")]
    Timeout,

    #[error("oldest pending request exceeded the request timeout")]
    RequestTimeout,

    #[error("connection is no longer alive: {0}")]
    TransportDown(String),

    #[error("operation not expressible at the negotiated API version: {0}")]
    BadVersion(String),

    #[error("API not supported at the negotiated version")]
    NotSupported,

    #[error("unknown topic or partition")]
    UnknownTopicOrPartition,

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("Kafka error code {0}: {1}")]
    KafkaErrorCode(i16, String),

    #[error("failed to connect to any of {} endpoints", .0.len())]
    FailedToConnect(Vec<(crate::Endpoint, String)>),

    #[error("the frame accumulator received a negative frame length: {0}")]
    InvalidFrameLength(i32),

    #[error("correlation ID {0} collided with a still-pending request")]
    CorrelationIdCollision(i32),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Whether this error, if observed by the connection actor, is fatal to the connection.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SendError(_)
                | Error::TransportClosed(_)
                | Error::TransportError(_)
                | Error::RequestTimeout
        )
    }
}

/// Why the transport closed, attached to [`Error::TransportClosed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCloseReason {
    TcpClosed,
    TlsClosed,
}

impl fmt::Display for TransportCloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCloseReason::TcpClosed => write!(f, "tcp_closed"),
            TransportCloseReason::TlsClosed => write!(f, "tls_closed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
