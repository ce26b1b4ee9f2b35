//! Error types shared by transports, clients and the log subsystem.

use thiserror::Error;

/// Failures to reach or talk to a plugin.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("failed to spawn '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("connection failed: {reason}")]
    Connect { reason: String },

    #[error("connection closed: {reason}")]
    Closed { reason: String },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl TransportError {
    pub fn connect(reason: impl Into<String>) -> Self {
        Self::Connect { reason: reason.into() }
    }

    pub fn closed(reason: impl Into<String>) -> Self {
        Self::Closed { reason: reason.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol { reason: reason.into() }
    }

    pub fn timeout(operation: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// The peer is gone; the connection cannot be used any more.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Connect { .. } | Self::Spawn { .. })
    }
}

/// Credentials were rejected or could not be applied.
#[derive(Debug, Error, Clone)]
pub enum AuthError {
    #[error("credentials rejected (HTTP {status})")]
    Rejected { status: u16 },

    #[error("invalid credential configuration: {reason}")]
    InvalidCredentials { reason: String },
}

/// The plugin answered but the tool call did not succeed.
#[derive(Debug, Error, Clone)]
pub enum ToolError {
    #[error("tool '{tool}' is not provided by this plugin")]
    NotFound { tool: String },

    #[error("tool '{tool}' rejected the call ({code}): {message}")]
    Rpc { tool: String, code: i64, message: String },

    #[error("tool '{tool}' reported an error: {message}")]
    Failed { tool: String, message: String },

    #[error("tool '{tool}' returned an unreadable result: {reason}")]
    InvalidResponse { tool: String, reason: String },

    #[error("arguments for tool '{tool}' must be a JSON object")]
    InvalidArguments { tool: String },
}

impl ToolError {
    pub fn tool(&self) -> &str {
        match self {
            Self::NotFound { tool }
            | Self::Rpc { tool, .. }
            | Self::Failed { tool, .. }
            | Self::InvalidResponse { tool, .. }
            | Self::InvalidArguments { tool } => tool,
        }
    }
}

/// Outcome classes for a tool invocation.
#[derive(Debug, Error, Clone)]
pub enum InvokeError {
    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Transport(TransportError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<TransportError> for InvokeError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::Auth(auth) => Self::Auth(auth),
            other => Self::Transport(other),
        }
    }
}

/// Errors related to logging operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("log export to {path} failed: {reason}")]
    ExportFailed { path: String, reason: String },

    #[error("audit log error: {reason}")]
    Audit { reason: String },
}

impl LogError {
    /// Create a log export failed error.
    pub fn export_failed(path: &std::path::Path, reason: impl Into<String>) -> Self {
        Self::ExportFailed {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}
