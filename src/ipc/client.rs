use std::fmt;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;

use super::protocol::{ClientRequest, RequestEnvelope, Response, to_line};
use crate::error::AppError;

/// Errors from the client side of the local socket.
#[derive(Debug)]
pub enum IpcError {
    /// Could not connect to the daemon socket.
    Connect(std::io::Error),
    /// Read/write failure on an established connection.
    Io(std::io::Error),
    /// The daemon closed the connection or sent something unparseable.
    Protocol(String),
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(e) => write!(f, "could not connect to daemon: {e}"),
            Self::Io(e) => write!(f, "daemon socket error: {e}"),
            Self::Protocol(msg) => write!(f, "daemon protocol error: {msg}"),
        }
    }
}

impl std::error::Error for IpcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Connect(e) | Self::Io(e) => Some(e),
            Self::Protocol(_) => None,
        }
    }
}

impl From<IpcError> for AppError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Connect(_) => Self::daemon_unreachable(),
            other => Self {
                message: other.to_string(),
                code: crate::error::ExitCode::ConnectionError,
                suggestion: None,
            },
        }
    }
}

/// A short-lived connection to the daemon: one handshake, then requests.
pub struct DaemonClient {
    reader: tokio::io::Lines<BufReader<tokio::net::unix::OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    session_id: Option<String>,
}

impl DaemonClient {
    /// Connect to the daemon socket and perform the handshake.
    ///
    /// # Errors
    ///
    /// Returns `IpcError::Connect` when no daemon is listening, or
    /// `IpcError::Protocol` when the handshake reply is malformed.
    pub async fn connect(socket: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(socket).await.map_err(IpcError::Connect)?;
        let (read_half, writer) = stream.into_split();
        let mut client = Self {
            reader: BufReader::new(read_half).lines(),
            writer,
            session_id: None,
        };

        let response = client.roundtrip(ClientRequest::Handshake).await?;
        client.session_id = response.session_id;
        Ok(client)
    }

    /// The session id reported by the handshake.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Send one request and read exactly one response.
    ///
    /// # Errors
    ///
    /// Returns `IpcError` on socket failure or a malformed reply.
    pub async fn roundtrip(&mut self, request: ClientRequest) -> Result<Response, IpcError> {
        let envelope = RequestEnvelope {
            session_id: self.session_id.clone(),
            request,
        };
        let line = to_line(&envelope).map_err(|e| IpcError::Protocol(e.to_string()))?;
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(IpcError::Io)?;

        let reply = self
            .reader
            .next_line()
            .await
            .map_err(IpcError::Io)?
            .ok_or_else(|| IpcError::Protocol("daemon closed the connection".into()))?;
        serde_json::from_str(&reply).map_err(|e| IpcError::Protocol(e.to_string()))
    }
}
