//! Error types for backend operations.

use thiserror::Error;

use crate::rpc::codec::CodecError;

/// Errors that can occur while starting or talking to a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Failed to spawn the language server process.
    #[error("failed to spawn language server '{command}': {source}")]
    SpawnFailed {
        /// The command that failed to spawn.
        command: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Language server executable not found.
    #[error("{command} not found. {install_hint}")]
    NotInstalled {
        /// The command that was not found.
        command: String,
        /// Installation instructions for the missing command.
        install_hint: String,
    },

    /// The workspace could not be checked out.
    #[error("failed to materialize {workspace}: {reason}")]
    Materialize {
        /// Workspace root being checked out.
        workspace: String,
        /// What went wrong.
        reason: String,
    },

    /// I/O error reading workspace files.
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The wire framing broke.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The server sent something that is not valid JSON-RPC.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered with an error response.
    #[error("backend error {code}: {message}")]
    Server {
        /// The JSON-RPC error code.
        code: i64,
        /// The error message from the server.
        message: String,
    },

    /// The server process exited or closed its output.
    #[error("backend exited unexpectedly")]
    Exited,

    /// The call was cancelled by the caller.
    #[error("backend call cancelled")]
    Cancelled,

    /// The initialize handshake failed.
    #[error("backend initialize handshake failed: {0}")]
    InitializeFailed(String),

    /// A path named by a request or result is outside the workspace.
    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl BackendError {
    /// Create a "not installed" error with an install hint.
    #[must_use]
    pub fn not_installed(command: &str, install_hint: &str) -> Self {
        Self::NotInstalled {
            command: command.to_string(),
            install_hint: install_hint.to_string(),
        }
    }

    /// Create a spawn failed error.
    #[must_use]
    pub fn spawn_failed(command: &str, source: std::io::Error) -> Self {
        Self::SpawnFailed {
            command: command.to_string(),
            source,
        }
    }

    /// Create a server error from a JSON-RPC error response.
    #[must_use]
    pub fn server_error(code: i64, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Whether the connection that produced this error can no longer serve
    /// calls.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exited | Self::Codec(_))
    }

    /// Create a materialization error.
    #[must_use]
    pub fn materialize(workspace: impl ToString, reason: impl Into<String>) -> Self {
        Self::Materialize {
            workspace: workspace.to_string(),
            reason: reason.into(),
        }
    }
}
