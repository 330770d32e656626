use std::fmt;

use serde::Serialize;

use crate::ipc::ErrorCode;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    ConnectionError = 2,
    ResourceNotFound = 3,
    TimeoutError = 4,
    ProtocolError = 5,
    SessionConflict = 6,
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::GeneralError => write!(f, "general error"),
            Self::ConnectionError => write!(f, "connection error"),
            Self::ResourceNotFound => write!(f, "resource not found"),
            Self::TimeoutError => write!(f, "timeout error"),
            Self::ProtocolError => write!(f, "protocol error"),
            Self::SessionConflict => write!(f, "session conflict"),
        }
    }
}

/// Stable mapping from IPC error codes to process exit codes.
#[must_use]
pub fn exit_code_for(code: ErrorCode) -> ExitCode {
    match code {
        ErrorCode::NoSession => ExitCode::ResourceNotFound,
        ErrorCode::SessionAlreadyRunning => ExitCode::SessionConflict,
        ErrorCode::ChromeLaunchFailed | ErrorCode::WorkerStartFailed => ExitCode::ConnectionError,
        ErrorCode::CdpTimeout => ExitCode::TimeoutError,
        ErrorCode::SessionKillFailed | ErrorCode::DaemonError => ExitCode::GeneralError,
    }
}

#[derive(Debug)]
pub struct AppError {
    pub message: String,
    pub code: ExitCode,
    pub suggestion: Option<String>,
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

impl AppError {
    pub fn general(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: ExitCode::GeneralError,
            suggestion: None,
        }
    }

    pub fn no_session() -> Self {
        Self {
            message: "no active session".into(),
            code: ExitCode::ResourceNotFound,
            suggestion: Some("Run `bdg start <url>` first".into()),
        }
    }

    pub fn daemon_unreachable() -> Self {
        Self {
            message: "could not connect to the bdg daemon".into(),
            code: ExitCode::ConnectionError,
            suggestion: Some("Run `bdg start <url>` to start a session".into()),
        }
    }

    pub fn from_ipc(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: exit_code_for(code),
            suggestion: None,
        }
    }

    #[must_use]
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn to_json(&self) -> String {
        let output = ErrorOutput {
            error: &self.message,
            code: self.code as u8,
            suggestion: self.suggestion.as_deref(),
        };
        serde_json::to_string(&output).unwrap_or_else(|_| {
            format!(
                r#"{{"error":"{}","code":{}}}"#,
                self.message, self.code as u8
            )
        })
    }

    pub fn print_json_stderr(&self) {
        eprintln!("{}", self.to_json());
    }
}

#[derive(Serialize)]
struct ErrorOutput<'a> {
    error: &'a str,
    code: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    suggestion: Option<&'a str>,
}
