//! Import paths whose hosting is fixed by convention.
//!
//! The standard distribution lives under `src/` of the Go repository, and
//! `golang.org/x/<repo>` is mirrored at `github.com/golang/<repo>`. Neither
//! needs a network round-trip.

use crate::descriptor::{RepositoryDescriptor, VcsKind};
use crate::error::{Error, Result};
use crate::known_host;

/// Repository that holds the standard distribution.
pub const STDLIB_CLONE_URL: &str = "https://github.com/golang/go";

/// Directory of the standard library inside [`STDLIB_CLONE_URL`].
pub const STDLIB_REPO_PREFIX: &str = "src";

const GOLANG_X_PREFIX: &str = "golang.org/x/";
const GOLANG_X_MIRROR: &str = "github.com/golang/";

/// Static lookup for conventionally hosted import paths.
#[derive(Debug, Clone)]
pub struct StaticTable {
    stdlib_revision: String,
}

impl StaticTable {
    /// Create a table whose standard-distribution entries are pinned to
    /// `stdlib_revision` (the running toolchain's version, e.g. `go1.7.1`).
    #[must_use]
    pub fn new(stdlib_revision: impl Into<String>) -> Self {
        Self {
            stdlib_revision: stdlib_revision.into(),
        }
    }

    /// The revision reported for standard-distribution packages.
    #[must_use]
    pub fn stdlib_revision(&self) -> &str {
        &self.stdlib_revision
    }

    /// Look up `import_path`, returning `Ok(None)` when no entry applies.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a `golang.org/x/` path that names
    /// no repository.
    pub fn lookup(&self, import_path: &str) -> Result<Option<RepositoryDescriptor>> {
        if is_standard_package(import_path) {
            let dir = format!("{STDLIB_REPO_PREFIX}/{import_path}");
            return Ok(Some(RepositoryDescriptor {
                import_path: import_path.to_string(),
                project_root: String::new(),
                clone_url: STDLIB_CLONE_URL.to_string(),
                vcs: VcsKind::Git,
                resolved_host_path: dir.clone(),
                repo_dir: dir,
                revision: Some(self.stdlib_revision.clone()),
            }));
        }

        if let Some(rest) = import_path.strip_prefix(GOLANG_X_PREFIX) {
            let mirrored = format!("{GOLANG_X_MIRROR}{rest}");
            let Some(mut descriptor) = known_host::match_known_host(&mirrored)? else {
                return Ok(None);
            };
            descriptor.import_path = import_path.to_string();
            descriptor.project_root = descriptor
                .project_root
                .replacen(GOLANG_X_MIRROR, GOLANG_X_PREFIX, 1);
            return Ok(Some(descriptor));
        }

        Ok(None)
    }
}

/// Standard-distribution packages have no dot in their first path element.
#[must_use]
pub fn is_standard_package(import_path: &str) -> bool {
    let first = import_path.split('/').next().unwrap_or_default();
    !first.is_empty() && !first.contains('.')
}
