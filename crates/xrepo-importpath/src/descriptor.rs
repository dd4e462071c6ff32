//! The resolved description of where an import path lives.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version control system that hosts a repository.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    /// Git.
    Git,
    /// Mercurial.
    Hg,
    /// Subversion.
    Svn,
    /// Bazaar.
    Bzr,
    /// Fossil.
    Fossil,
    /// Anything else a discovery tag declared.
    Other(String),
}

impl VcsKind {
    /// The name as it appears in a `go-import` tag.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Git => "git",
            Self::Hg => "hg",
            Self::Svn => "svn",
            Self::Bzr => "bzr",
            Self::Fossil => "fossil",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for VcsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VcsKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "git" => Self::Git,
            "hg" => Self::Hg,
            "svn" => Self::Svn,
            "bzr" => Self::Bzr,
            "fossil" => Self::Fossil,
            other => Self::Other(other.to_string()),
        })
    }
}

/// Where the package named by an import path is hosted.
///
/// `project_root` is the prefix of `import_path` owned by the remote
/// repository; everything below it is a directory inside that repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryDescriptor {
    /// The import path that was resolved, verbatim.
    pub import_path: String,
    /// Prefix of `import_path` that names the repository root. Empty for the
    /// standard distribution.
    pub project_root: String,
    /// URL the repository can be cloned from.
    pub clone_url: String,
    /// Version control system of the repository.
    pub vcs: VcsKind,
    /// Host and path of the package after following any vanity redirect.
    pub resolved_host_path: String,
    /// Directory of the package inside the repository, without leading slash.
    pub repo_dir: String,
    /// Pinned revision, when the source of the descriptor implies one.
    pub revision: Option<String>,
}

impl RepositoryDescriptor {
    /// The clone URL without its scheme, e.g. `github.com/alice/pkg`.
    ///
    /// This is the repository identifier used in workspace URIs.
    #[must_use]
    pub fn repository(&self) -> &str {
        strip_scheme(&self.clone_url)
    }
}

/// Strip a `scheme://` prefix, if present.
pub(crate) fn strip_scheme(url: &str) -> &str {
    url.find("://").map_or(url, |idx| &url[idx + 3..])
}
