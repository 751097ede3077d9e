//! Error taxonomy shared by the sandbox, permission and session layers.

use crate::permissions::Operation;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The sandbox was explicitly stopped; it must be started again before use.
    #[error("Sandbox '{id}' is stopped")]
    SandboxStopped { id: String },

    #[error("Access denied: '{path}' {reason}")]
    PathNotAllowed { path: String, reason: String },

    #[error("Permission denied for {operation} on '{target}'{}", fmt_reason(.reason))]
    PermissionDenied {
        operation: Operation,
        target: String,
        reason: Option<String>,
    },

    #[error("Permission required for {operation} on '{target}'{}", fmt_reason(.reason))]
    PermissionAskUnavailable {
        operation: Operation,
        target: String,
        reason: Option<String>,
    },

    #[error("String '{needle}' not found in {path}")]
    EditNotFound { path: String, needle: String },

    #[error(
        "String '{needle}' found {occurrences} times in {path}. Use replace_all to replace all, or provide more context"
    )]
    EditAmbiguous {
        path: String,
        needle: String,
        occurrences: usize,
    },

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Invalid session id '{0}'")]
    InvalidSessionId(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("'{0}' is a directory")]
    IsDirectory(String),

    #[error("Operation cancelled before approval")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0:#}")]
    Engine(#[source] anyhow::Error),
}

fn fmt_reason(reason: &Option<String>) -> String {
    match reason {
        Some(r) if !r.is_empty() => format!(": {}", r),
        _ => String::new(),
    }
}

impl Error {
    pub(crate) fn invalid_pattern(pattern: &str, message: impl ToString) -> Self {
        Error::InvalidPattern {
            pattern: pattern.to_string(),
            message: message.to_string(),
        }
    }

    pub(crate) fn path_not_allowed(path: &str, reason: impl Into<String>) -> Self {
        Error::PathNotAllowed {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// True for errors raised by policy checks before anything touched the sandbox.
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied { .. }
                | Error::PermissionAskUnavailable { .. }
                | Error::PathNotAllowed { .. }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Engine(err)
    }
}
