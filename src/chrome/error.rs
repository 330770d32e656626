use std::fmt;

/// Errors that can occur during Chrome discovery and launch.
#[derive(Debug)]
pub enum ChromeError {
    /// Chrome executable was not found on the system.
    NotFound(String),

    /// Chrome process failed to launch.
    LaunchFailed(String),

    /// Chrome did not start accepting connections within the timeout.
    StartupTimeout {
        /// The port Chrome was expected to listen on.
        port: u16,
    },

    /// HTTP request to Chrome's debug endpoint failed.
    HttpError(String),

    /// Failed to parse a response from Chrome.
    ParseError(String),

    /// No debuggable page target was found.
    NoPageTarget,

    /// An I/O error occurred.
    Io(std::io::Error),
}

impl fmt::Display for ChromeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "Chrome not found: {msg}"),
            Self::LaunchFailed(msg) => write!(f, "Chrome launch failed: {msg}"),
            Self::StartupTimeout { port } => {
                write!(f, "Chrome startup timed out on port {port}")
            }
            Self::HttpError(msg) => write!(f, "Chrome HTTP error: {msg}"),
            Self::ParseError(msg) => write!(f, "Chrome parse error: {msg}"),
            Self::NoPageTarget => write!(f, "no debuggable page target found"),
            Self::Io(e) => write!(f, "Chrome I/O error: {e}"),
        }
    }
}

impl std::error::Error for ChromeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ChromeError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
