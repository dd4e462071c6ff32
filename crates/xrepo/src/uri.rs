//! Repository URIs and workspace keys.
//!
//! A workspace root is written `scheme://repository?revision`, e.g.
//! `git://github.com/gorilla/mux?0a192a19`. A file inside it adds a fragment:
//! `git://github.com/golang/go?go1.7.1#src/bytes/buffer.go`. An absent
//! revision means the repository's default branch.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scheme used for repositories addressed by clone location.
pub const GIT_SCHEME: &str = "git";

/// A malformed repository URI.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid repository URI {uri:?}: {reason}")]
pub struct UriError {
    /// The rejected input.
    pub uri: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

/// `scheme://repository?revision#path`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoUri {
    scheme: String,
    repository: String,
    revision: Option<String>,
    path: Option<String>,
}

impl RepoUri {
    /// A `git://` root for `repository` (`host/path`, no scheme).
    #[must_use]
    pub fn git(repository: impl Into<String>, revision: Option<String>) -> Self {
        Self {
            scheme: GIT_SCHEME.to_string(),
            repository: repository.into().trim_end_matches('/').to_string(),
            revision: revision.filter(|r| !r.is_empty()),
            path: None,
        }
    }

    /// The URI scheme, e.g. `git`.
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The repository identifier without scheme, e.g. `github.com/golang/go`.
    #[must_use]
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The pinned revision, if any.
    #[must_use]
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// The file path inside the repository, if any.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// `scheme://repository` with neither revision nor path.
    #[must_use]
    pub fn repository_id(&self) -> String {
        format!("{}://{}", self.scheme, self.repository)
    }

    /// The same URI without its path: the workspace root.
    #[must_use]
    pub fn root(&self) -> Self {
        Self {
            path: None,
            ..self.clone()
        }
    }

    /// The same root pinned to `revision`.
    #[must_use]
    pub fn with_revision(&self, revision: Option<String>) -> Self {
        Self {
            revision: revision.filter(|r| !r.is_empty()),
            ..self.clone()
        }
    }

    /// The file `path` inside this URI's repository and revision.
    #[must_use]
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = path.trim_start_matches('/');
        Self {
            path: (!path.is_empty()).then(|| path.to_string()),
            ..self.clone()
        }
    }

    /// Whether `other` names the same repository at the same revision.
    #[must_use]
    pub fn same_workspace(&self, other: &Self) -> bool {
        self.scheme == other.scheme
            && self.repository == other.repository
            && self.revision == other.revision
    }
}

impl fmt::Display for RepoUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.repository)?;
        if let Some(revision) = &self.revision {
            write!(f, "?{revision}")?;
        }
        if let Some(path) = &self.path {
            write!(f, "#{path}")?;
        }
        Ok(())
    }
}

impl FromStr for RepoUri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| UriError {
            uri: s.to_string(),
            reason,
        };
        if s.chars().any(char::is_whitespace) {
            return Err(err("contains whitespace"));
        }

        let (scheme, rest) = s.split_once("://").ok_or_else(|| err("missing scheme"))?;
        if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
            return Err(err("invalid scheme"));
        }

        let (rest, path) = match rest.split_once('#') {
            Some((rest, path)) => (rest, Some(path.trim_start_matches('/'))),
            None => (rest, None),
        };
        let (repository, revision) = match rest.split_once('?') {
            Some((repository, revision)) => (repository, Some(revision)),
            None => (rest, None),
        };

        let repository = repository.trim_end_matches('/');
        if repository.is_empty() {
            return Err(err("missing repository"));
        }
        if repository.split('/').any(|seg| seg.is_empty() || seg == "..") {
            return Err(err("malformed repository path"));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            repository: repository.to_string(),
            revision: revision.filter(|r| !r.is_empty()).map(str::to_string),
            path: path.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }
}

impl Serialize for RepoUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RepoUri {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The unit the connection pool connects to: a language mode over a
/// repository root at a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceKey {
    /// Language mode, e.g. `go`.
    pub mode: String,
    /// Workspace root (no path component).
    pub root: RepoUri,
}

impl WorkspaceKey {
    /// Key for `mode` over the root of `uri`.
    #[must_use]
    pub fn new(mode: impl Into<String>, uri: &RepoUri) -> Self {
        Self {
            mode: mode.into(),
            root: uri.root(),
        }
    }
}

impl fmt::Display for WorkspaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mode, self.root)
    }
}
