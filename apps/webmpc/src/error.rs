use thiserror::Error;

/// Failure reported by the upstream music server client.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The server closed the connection cleanly.
    #[error("connection closed by server")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The server answered something the client doesn't understand.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The server rejected a single command (`ACK [code@index] {command} message`).
    #[error("command `{command}` rejected ({code}): {message}")]
    Ack {
        code: u32,
        command: String,
        message: String,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl UpstreamError {
    /// Whether the connection this error came from is unusable afterwards.
    ///
    /// Rejected commands and bad arguments leave the connection intact. A
    /// closed socket, a broken stream or a garbled response does not.
    pub fn invalidates_connection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::Io(_) | Self::Protocol(_)
        )
    }
}

pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Failure while executing a single command.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl DispatchError {
    pub fn invalidates_connection(&self) -> bool {
        match self {
            Self::UnknownOperation(_) => false,
            Self::Upstream(e) => e.invalidates_connection(),
        }
    }
}

/// A client message that isn't a valid command document.
#[derive(Debug, Error)]
#[error("malformed command: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Failure on a client's message stream.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] axum::Error),
    #[error("transport closed")]
    Closed,
}

/// The broker has stopped and no longer accepts commands.
#[derive(Debug, Error)]
#[error("broker is not running")]
pub struct BrokerGone;
