//! Error taxonomy surfaced to proxy clients.
//!
//! Every failure a request can produce is folded into [`ProxyError`], which
//! knows its JSON-RPC error code and whether a client may usefully retry.

use thiserror::Error;

use crate::backend::BackendError;
use crate::pool::PoolError;
use crate::rewrite::RewriteError;
use crate::uri::UriError;

/// JSON-RPC code for a body that is not JSON.
pub const PARSE_ERROR: i64 = -32700;
/// JSON-RPC code for a message that is not a valid request.
pub const INVALID_REQUEST: i64 = -32600;
/// JSON-RPC code for an unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// JSON-RPC code for malformed parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// A request arrived before `initialize` completed.
pub const SERVER_NOT_INITIALIZED: i64 = -32002;
/// The client cancelled the request.
pub const REQUEST_CANCELLED: i64 = -32800;
/// No definition, hover or repository could be found.
pub const NOT_FOUND: i64 = -32004;
/// No analysis backend could be started for a workspace.
pub const BACKEND_UNAVAILABLE: i64 = -32005;
/// The connection to a backend failed mid-request.
pub const TRANSIENT_COMMUNICATION: i64 = -32006;
/// Discovery found conflicting repository declarations.
pub const AMBIGUOUS_RESOLUTION: i64 = -32007;
/// Discovery found disagreeing repository declarations.
pub const RESOLUTION_MISMATCH: i64 = -32008;

/// Errors reported to a proxy client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Malformed parameters: a bad URI, path or position.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// More than one repository claims an import path.
    #[error("ambiguous resolution: {0}")]
    AmbiguousResolution(String),

    /// Repository declarations for an import path disagree.
    #[error("resolution mismatch: {0}")]
    ResolutionMismatch(String),

    /// Nothing was found.
    #[error("{0}")]
    NotFound(String),

    /// A backend for the workspace could not be started.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Communication with a running backend failed.
    #[error("transient communication failure: {0}")]
    TransientCommunication(String),

    /// The session has not completed `initialize`.
    #[error("session is not initialized")]
    NotInitialized,

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The request is not valid in the session's current state.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The method is not served by the proxy.
    #[error("method not found: {0}")]
    MethodNotFound(String),
}

impl ProxyError {
    /// Short, stable name of the error category.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::AmbiguousResolution(_) => "ambiguous_resolution",
            Self::ResolutionMismatch(_) => "resolution_mismatch",
            Self::NotFound(_) => "not_found",
            Self::BackendUnavailable(_) => "backend_unavailable",
            Self::TransientCommunication(_) => "transient_communication",
            Self::NotInitialized => "not_initialized",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest(_) => "invalid_request",
            Self::MethodNotFound(_) => "method_not_found",
        }
    }

    /// JSON-RPC error code.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidInput(_) => INVALID_PARAMS,
            Self::AmbiguousResolution(_) => AMBIGUOUS_RESOLUTION,
            Self::ResolutionMismatch(_) => RESOLUTION_MISMATCH,
            Self::NotFound(_) => NOT_FOUND,
            Self::BackendUnavailable(_) => BACKEND_UNAVAILABLE,
            Self::TransientCommunication(_) => TRANSIENT_COMMUNICATION,
            Self::NotInitialized => SERVER_NOT_INITIALIZED,
            Self::Cancelled => REQUEST_CANCELLED,
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
        }
    }

    /// Whether the same request may succeed if sent again.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable(_) | Self::TransientCommunication(_)
        )
    }

    pub(crate) fn definition_not_found() -> Self {
        Self::NotFound("definition not found".to_string())
    }
}

impl From<xrepo_importpath::Error> for ProxyError {
    fn from(err: xrepo_importpath::Error) -> Self {
        use xrepo_importpath::Error as E;
        match err {
            E::InvalidInput { .. } => Self::InvalidInput(err.to_string()),
            E::Ambiguous { .. } => Self::AmbiguousResolution(err.to_string()),
            E::Mismatch { .. } => Self::ResolutionMismatch(err.to_string()),
            E::NotFound { .. } => Self::NotFound(err.to_string()),
            E::Transient { .. } => Self::TransientCommunication(err.to_string()),
            E::Cancelled(_) => Self::Cancelled,
        }
    }
}

impl From<PoolError> for ProxyError {
    fn from(err: PoolError) -> Self {
        Self::BackendUnavailable(err.to_string())
    }
}

impl From<BackendError> for ProxyError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Cancelled => Self::Cancelled,
            BackendError::Server { code, .. } if code == REQUEST_CANCELLED => Self::Cancelled,
            BackendError::Server { .. } | BackendError::InvalidPath(_) => {
                Self::NotFound(err.to_string())
            }
            _ => Self::TransientCommunication(err.to_string()),
        }
    }
}

impl From<RewriteError> for ProxyError {
    fn from(err: RewriteError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<UriError> for ProxyError {
    fn from(err: UriError) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ProxyError::InvalidInput(String::new()), -32602, false)]
    #[case(ProxyError::NotFound(String::new()), -32004, false)]
    #[case(ProxyError::BackendUnavailable(String::new()), -32005, true)]
    #[case(ProxyError::TransientCommunication(String::new()), -32006, true)]
    #[case(ProxyError::NotInitialized, -32002, false)]
    #[case(ProxyError::Cancelled, -32800, false)]
    #[case(ProxyError::MethodNotFound(String::new()), -32601, false)]
    fn codes_and_retryability(
        #[case] err: ProxyError,
        #[case] code: i64,
        #[case] retryable: bool,
    ) {
        assert_eq!(err.code(), code);
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn resolver_errors_keep_their_category() {
        let err: ProxyError = xrepo_importpath::Error::Ambiguous {
            import_path: "alice.org/pkg".to_string(),
            url: "https://alice.org/pkg?go-get=1".to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
        }
        .into();
        assert_eq!(err.kind(), "ambiguous_resolution");

        let err: ProxyError = xrepo_importpath::Error::Cancelled("x".to_string()).into();
        assert_eq!(err, ProxyError::Cancelled);
    }

    #[test]
    fn backend_transport_faults_are_transient() {
        let err: ProxyError = BackendError::Exited.into();
        assert_eq!(err.kind(), "transient_communication");
        assert!(err.is_retryable());

        let err: ProxyError = BackendError::server_error(-32800, "cancelled").into();
        assert_eq!(err, ProxyError::Cancelled);
    }
}
