//! Error types for import path resolution.

use thiserror::Error;

use crate::discovery::Attempt;

/// Errors that can occur while resolving an import path.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The import path is syntactically malformed.
    #[error("invalid import path {path:?}: {reason}")]
    InvalidInput {
        /// The offending import path.
        path: String,
        /// Why it was rejected.
        reason: String,
    },

    /// More than one distinct `go-import` tag claims the longest matching root.
    #[error("ambiguous go-import meta tags for {import_path} at {url}: {candidates:?}")]
    Ambiguous {
        /// The import path being resolved.
        import_path: String,
        /// The URL whose document carried the conflicting tags.
        url: String,
        /// The distinct `ROOT VCS REPO` triples found.
        candidates: Vec<String>,
    },

    /// The tag at the project root disagrees with the tag found below it.
    #[error("go-import meta tag mismatch for {import_path}: {found} at {found_at}, but {root_tag} at project root")]
    Mismatch {
        /// The import path being resolved.
        import_path: String,
        /// The tag discovered at the longer prefix.
        found: String,
        /// Where the longer-prefix tag was discovered.
        found_at: String,
        /// The tag served at the project root.
        root_tag: String,
    },

    /// No `go-import` tag was found at any candidate prefix.
    #[error("go-import meta tag not found for {import_path} (tried {})", summarize(.attempts))]
    NotFound {
        /// The import path being resolved.
        import_path: String,
        /// Every URL that was tried, longest prefix first.
        attempts: Vec<Attempt>,
    },

    /// The HTTP client could not be constructed or failed unexpectedly.
    #[error("transient discovery failure for {import_path}: {message}")]
    Transient {
        /// The import path being resolved.
        import_path: String,
        /// The underlying failure.
        message: String,
    },

    /// Resolution was cancelled by the caller.
    #[error("resolution of {0} cancelled")]
    Cancelled(String),
}

impl Error {
    /// Create an invalid input error.
    #[must_use]
    pub fn invalid(path: &str, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    /// Short, stable name of the error category, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput { .. } => "invalid_input",
            Self::Ambiguous { .. } => "ambiguous_resolution",
            Self::Mismatch { .. } => "resolution_mismatch",
            Self::NotFound { .. } => "not_found",
            Self::Transient { .. } => "transient",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

fn summarize(attempts: &[Attempt]) -> String {
    if attempts.is_empty() {
        return "nothing".to_string();
    }
    attempts
        .iter()
        .map(|a| a.url.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for import path resolution.
pub type Result<T> = std::result::Result<T, Error>;
