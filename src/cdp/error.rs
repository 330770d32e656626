use std::fmt;

/// Errors that can occur during CDP communication.
#[derive(Debug)]
pub enum CdpError {
    /// WebSocket connection could not be established.
    Connection(String),

    /// Connection attempt exceeded the configured timeout.
    ConnectionTimeout,

    /// A command did not receive a response within the configured timeout.
    CommandTimeout {
        /// The CDP method that timed out.
        method: String,
    },

    /// Chrome returned a CDP protocol-level error.
    Protocol {
        /// The CDP error code (e.g., -32000).
        code: i64,
        /// The CDP error message.
        message: String,
    },

    /// The WebSocket connection closed. There is no reconnection: the worker
    /// treats a closed CDP transport as fatal and begins shutdown.
    ConnectionClosed,

    /// Failed to parse a message received from Chrome.
    InvalidResponse(String),

    /// Internal error (transport task died or channel closed).
    Internal(String),
}

impl fmt::Display for CdpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(msg) => write!(f, "CDP connection error: {msg}"),
            Self::ConnectionTimeout => write!(f, "CDP connection timed out"),
            Self::CommandTimeout { method } => {
                write!(f, "CDP command timed out: {method}")
            }
            Self::Protocol { code, message } => {
                write!(f, "CDP protocol error ({code}): {message}")
            }
            Self::ConnectionClosed => write!(f, "CDP connection closed"),
            Self::InvalidResponse(msg) => {
                write!(f, "CDP invalid response: {msg}")
            }
            Self::Internal(msg) => write!(f, "CDP internal error: {msg}"),
        }
    }
}

impl std::error::Error for CdpError {}

impl CdpError {
    /// True for errors that mean the transport itself is gone, as opposed to
    /// a single command failing.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::ConnectionClosed | Self::Internal(_)
        )
    }
}

impl From<CdpError> for crate::error::AppError {
    fn from(e: CdpError) -> Self {
        use crate::error::ExitCode;
        let code = match &e {
            CdpError::Connection(_) | CdpError::ConnectionClosed => ExitCode::ConnectionError,
            CdpError::ConnectionTimeout | CdpError::CommandTimeout { .. } => ExitCode::TimeoutError,
            CdpError::Protocol { .. } => ExitCode::ProtocolError,
            CdpError::InvalidResponse(_) | CdpError::Internal(_) => ExitCode::GeneralError,
        };
        Self {
            message: e.to_string(),
            code,
            suggestion: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_connection() {
        let err = CdpError::Connection("refused".into());
        assert_eq!(err.to_string(), "CDP connection error: refused");
    }

    #[test]
    fn display_command_timeout() {
        let err = CdpError::CommandTimeout {
            method: "Page.navigate".into(),
        };
        assert_eq!(err.to_string(), "CDP command timed out: Page.navigate");
    }

    #[test]
    fn display_protocol() {
        let err = CdpError::Protocol {
            code: -32000,
            message: "Not found".into(),
        };
        assert_eq!(err.to_string(), "CDP protocol error (-32000): Not found");
    }

    #[test]
    fn fatal_classification() {
        assert!(CdpError::ConnectionClosed.is_fatal());
        assert!(CdpError::Internal("gone".into()).is_fatal());
        assert!(
            !CdpError::CommandTimeout {
                method: "DOM.focus".into()
            }
            .is_fatal()
        );
        assert!(
            !CdpError::Protocol {
                code: -32000,
                message: "nope".into()
            }
            .is_fatal()
        );
    }

    #[test]
    fn error_trait_is_implemented() {
        let err: &dyn std::error::Error = &CdpError::ConnectionClosed;
        assert!(err.source().is_none());
    }
}
