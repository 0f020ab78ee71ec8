//! Client-facing error types with suggestions.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for protocol responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SessionNotFound,
    /// Panel missing, owned by another user, or not attached on this connection.
    AttachmentConflict,
    SpawnFailed,
    ProcessTerminated,
    Unauthenticated,
    LimitReached,
    InvalidInput,
    CommandFailed,
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::AttachmentConflict => "ATTACHMENT_CONFLICT",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::ProcessTerminated => "PROCESS_TERMINATED",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
            ErrorCode::LimitReached => "LIMIT_REACHED",
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::CommandFailed => "COMMAND_FAILED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(code)
    }
}

/// An error response with a hint for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestion: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (hint: {})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn session_not_found(session_id: &str) -> Self {
        Self {
            code: ErrorCode::SessionNotFound,
            message: format!("Session '{}' not found", session_id),
            suggestion: Some("Run 'tabmux sessions' to see available sessions".into()),
        }
    }

    pub fn panel_not_found(panel_id: &str) -> Self {
        Self {
            code: ErrorCode::AttachmentConflict,
            message: format!("Panel '{}' not found", panel_id),
            suggestion: Some("Reload the session layout; the panel may have been closed".into()),
        }
    }

    /// The panel exists but is not attached on this connection.
    pub fn not_attached(panel_id: &str) -> Self {
        Self {
            code: ErrorCode::AttachmentConflict,
            message: format!("Panel '{}' is not attached on this connection", panel_id),
            suggestion: Some("Send attach_panel before input or resize".into()),
        }
    }

    pub fn spawn_failed(command: &[String], error: &str) -> Self {
        let cmd_str = if command.is_empty() {
            "(empty command)".to_string()
        } else {
            command.join(" ")
        };
        Self {
            code: ErrorCode::SpawnFailed,
            message: format!("Failed to spawn '{}': {}", cmd_str, error),
            suggestion: Some(format!(
                "Verify '{}' exists and is executable, or start the daemon with a different --shell",
                command.first().map_or("the shell", |s| s.as_str())
            )),
        }
    }

    pub fn process_terminated(panel_id: &str) -> Self {
        Self {
            code: ErrorCode::ProcessTerminated,
            message: format!("The shell in panel '{}' has ended", panel_id),
            suggestion: Some("Open a new panel to start another shell".into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            message: "Connection has not identified a user".to_string(),
            suggestion: Some("Send a hello command with the user id first".into()),
        }
    }

    pub fn limit_reached(what: &str, max: usize) -> Self {
        Self {
            code: ErrorCode::LimitReached,
            message: format!("Maximum {} limit ({}) reached", what, max),
            suggestion: Some(format!("Close an existing {} before creating a new one", what)),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some("Check the command syntax and try again".into()),
        }
    }

    /// Create an invalid input error with a custom suggestion.
    pub fn invalid_input_with_suggestion(
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidInput,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::CommandFailed,
            message: message.into(),
            suggestion: Some("Retry the command; check the daemon log if it keeps failing".into()),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InternalError,
            message: message.into(),
            suggestion: Some("This is an internal error. Please report it if it persists.".into()),
        }
    }
}
