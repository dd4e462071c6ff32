//! Turning a workspace root into a directory a language server can read.

use async_trait::async_trait;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{BackendError, Result};
use crate::uri::{GIT_SCHEME, RepoUri};

/// Produces a local checkout for a workspace root.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Local directory holding the files of `root`.
    async fn materialize(&self, root: &RepoUri) -> Result<PathBuf>;
}

/// Checks repositories out with the `git` command line.
///
/// Each root gets its own directory under the cache, named by the SHA-256 of
/// `repository@revision`. An existing checkout is reused as is. Checkouts of
/// the same directory are serialized; different directories proceed in
/// parallel.
#[derive(Debug, Clone)]
pub struct GitMaterializer {
    cache_dir: PathBuf,
    git: String,
    locks: Arc<DashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl GitMaterializer {
    /// Materialize into `cache_dir`.
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            git: "git".to_string(),
            locks: Arc::new(DashMap::new()),
        }
    }

    /// Use a different `git` executable.
    #[must_use]
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Directory a root is (or would be) checked out into.
    #[must_use]
    pub fn checkout_dir(&self, root: &RepoUri) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(root.repository().as_bytes());
        hasher.update(b"@");
        hasher.update(root.revision().unwrap_or("").as_bytes());
        let digest = hasher.finalize();

        let mut name = String::with_capacity(digest.len() * 2);
        for byte in digest {
            let _ = write!(name, "{byte:02x}");
        }
        self.cache_dir.join(name)
    }

    fn lock_for(&self, dir: &Path) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(dir.to_path_buf()).or_default().value())
    }

    /// Run git and return its trimmed standard output.
    async fn run_git(&self, root: &RepoUri, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        let mut command = Command::new(&self.git);
        command.args(args).env("GIT_TERMINAL_PROMPT", "0");
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BackendError::not_installed(&self.git, "Install git and ensure it's in your PATH.")
            } else {
                BackendError::spawn_failed(&self.git, e)
            }
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(BackendError::materialize(
                root,
                format!("git {} failed: {}", args.join(" "), stderr.trim()),
            ))
        }
    }

    /// Resolve `revision` to a commit id inside the fresh clone at `repo`.
    ///
    /// Branches only exist as `origin/<name>` right after a clone, so that
    /// spelling is tried second.
    async fn resolve_commit(&self, root: &RepoUri, revision: &str, repo: &Path) -> Result<String> {
        let mut last_err = None;
        for candidate in [revision.to_string(), format!("origin/{revision}")] {
            let revspec = format!("{candidate}^{{commit}}");
            let args = ["rev-parse", "--verify", "--quiet", "--end-of-options", revspec.as_str()];
            match self.run_git(root, &args, Some(repo)).await {
                Ok(commit) if !commit.is_empty() => return Ok(commit),
                Ok(_) => {}
                Err(e @ (BackendError::NotInstalled { .. } | BackendError::SpawnFailed { .. })) => {
                    return Err(e);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            BackendError::materialize(root, format!("unknown revision {revision:?}"))
        }))
    }
}

/// Reject revisions git could read as an option or that carry whitespace or
/// control characters.
fn validate_revision(root: &RepoUri, revision: &str) -> Result<()> {
    if revision.starts_with('-') {
        return Err(BackendError::materialize(
            root,
            format!("revision {revision:?} must not start with '-'"),
        ));
    }
    if revision.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(BackendError::materialize(
            root,
            format!("revision {revision:?} contains whitespace or control characters"),
        ));
    }
    Ok(())
}

#[async_trait]
impl Materializer for GitMaterializer {
    async fn materialize(&self, root: &RepoUri) -> Result<PathBuf> {
        if root.scheme() != GIT_SCHEME {
            return Err(BackendError::materialize(
                root,
                format!("cannot check out {}:// roots", root.scheme()),
            ));
        }
        if let Some(revision) = root.revision() {
            validate_revision(root, revision)?;
        }

        let dir = self.checkout_dir(root);
        let lock = self.lock_for(&dir);
        let _guard = lock.lock().await;

        if fs::try_exists(dir.join(".git")).await? {
            debug!(workspace = %root, dir = %dir.display(), "Reusing checkout");
            return Ok(dir);
        }

        fs::create_dir_all(&self.cache_dir).await?;
        let staging = dir.with_extension("partial");
        match fs::remove_dir_all(&staging).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let staging_str = staging
            .to_str()
            .ok_or_else(|| BackendError::InvalidPath(staging.display().to_string()))?;
        let clone_url = format!("https://{}", root.repository());
        info!(workspace = %root, url = %clone_url, "Cloning repository");
        self.run_git(
            root,
            &["clone", "--quiet", "--", &clone_url, staging_str],
            None,
        )
        .await?;

        if let Some(revision) = root.revision().filter(|r| *r != "HEAD") {
            let commit = self.resolve_commit(root, revision, &staging).await?;
            debug!(workspace = %root, %commit, "Resolved revision");
            self.run_git(
                root,
                &["checkout", "--quiet", "--detach", &commit],
                Some(&staging),
            )
            .await?;
        }

        fs::rename(&staging, &dir).await?;
        debug!(workspace = %root, dir = %dir.display(), "Checkout ready");
        Ok(dir)
    }
}

/// Serves fixed directories for known roots; anything else fails.
#[derive(Debug, Clone, Default)]
pub struct StaticMaterializer {
    dirs: HashMap<RepoUri, PathBuf>,
}

impl StaticMaterializer {
    /// An empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `dir` for `root`.
    #[must_use]
    pub fn with(mut self, root: &RepoUri, dir: impl Into<PathBuf>) -> Self {
        self.dirs.insert(root.root(), dir.into());
        self
    }
}

#[async_trait]
impl Materializer for StaticMaterializer {
    async fn materialize(&self, root: &RepoUri) -> Result<PathBuf> {
        self.dirs
            .get(&root.root())
            .cloned()
            .ok_or_else(|| BackendError::materialize(root, "no directory configured"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn root(rev: Option<&str>) -> RepoUri {
        RepoUri::git("github.com/gorilla/mux", rev.map(str::to_string))
    }

    #[test]
    fn checkout_dir_is_stable_and_revision_specific() {
        let materializer = GitMaterializer::new("/cache");
        let a = materializer.checkout_dir(&root(Some("v1")));
        let b = materializer.checkout_dir(&root(Some("v1")));
        let c = materializer.checkout_dir(&root(Some("v2")));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("/cache"));
        assert_eq!(a.file_name().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn existing_checkout_is_reused_without_git() {
        let cache = tempfile::tempdir().unwrap();
        let materializer =
            GitMaterializer::new(cache.path()).with_git("definitely-not-a-git-binary");
        let dir = materializer.checkout_dir(&root(None));
        std::fs::create_dir_all(dir.join(".git")).unwrap();

        let got = materializer.materialize(&root(None)).await.unwrap();
        assert_eq!(got, dir);
    }

    #[tokio::test]
    async fn missing_git_is_reported() {
        let cache = tempfile::tempdir().unwrap();
        let materializer =
            GitMaterializer::new(cache.path()).with_git("definitely-not-a-git-binary");

        let err = materializer.materialize(&root(Some("v1"))).await.unwrap_err();
        assert!(
            matches!(err, BackendError::NotInstalled { .. }),
            "got {err:?}"
        );
    }

    #[rstest]
    #[case("--upload-pack=touch pwned")]
    #[case("-b")]
    #[case("v1 --force")]
    #[case("v1\tmain")]
    #[case("v1\u{7}")]
    #[tokio::test]
    async fn unsafe_revision_is_rejected_before_git_runs(#[case] revision: &str) {
        let cache = tempfile::tempdir().unwrap();
        let materializer =
            GitMaterializer::new(cache.path()).with_git("definitely-not-a-git-binary");

        let err = materializer.materialize(&root(Some(revision))).await.unwrap_err();
        assert!(
            matches!(err, BackendError::Materialize { .. }),
            "got {err:?}"
        );
        assert!(!materializer.checkout_dir(&root(Some(revision))).exists());
    }

    #[tokio::test]
    async fn non_git_root_is_rejected() {
        let cache = tempfile::tempdir().unwrap();
        let materializer =
            GitMaterializer::new(cache.path()).with_git("definitely-not-a-git-binary");
        let root: RepoUri = "hg://example.org/repo?tip".parse().unwrap();

        let err = materializer.materialize(&root).await.unwrap_err();
        assert!(
            matches!(err, BackendError::Materialize { .. }),
            "got {err:?}"
        );
    }

    #[test]
    fn same_checkout_dir_shares_one_lock() {
        let materializer = GitMaterializer::new("/cache");
        let dir = materializer.checkout_dir(&root(Some("v1")));
        let other = materializer.checkout_dir(&root(Some("v2")));

        let shared = materializer.clone();
        assert!(Arc::ptr_eq(&materializer.lock_for(&dir), &shared.lock_for(&dir)));
        assert!(!Arc::ptr_eq(&materializer.lock_for(&dir), &materializer.lock_for(&other)));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_materializations_clone_once() {
        use std::os::unix::fs::PermissionsExt;

        let scratch = tempfile::tempdir().unwrap();
        let log = scratch.path().join("calls");
        let git = scratch.path().join("fake-git");
        std::fs::write(
            &git,
            format!(
                "#!/bin/sh\n\
                 echo \"$1\" >> '{}'\n\
                 if [ \"$1\" = clone ]; then\n\
                 sleep 0.2\n\
                 for last; do :; done\n\
                 mkdir -p \"$last/.git\"\n\
                 fi\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let cache = scratch.path().join("cache");
        let materializer = GitMaterializer::new(&cache).with_git(git.display().to_string());
        let other = materializer.clone();
        let workspace = root(None);
        let (a, b) = tokio::join!(
            materializer.materialize(&workspace),
            other.materialize(&workspace)
        );

        assert_eq!(a.unwrap(), b.unwrap());
        let calls = std::fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().collect::<Vec<_>>(), vec!["clone"]);
    }

    #[tokio::test]
    async fn static_materializer_serves_known_roots_only() {
        let known = root(Some("v1"));
        let materializer = StaticMaterializer::new().with(&known, "/srv/mux");

        assert_eq!(
            materializer
                .materialize(&known.with_path("mux.go"))
                .await
                .unwrap(),
            PathBuf::from("/srv/mux")
        );
        assert!(materializer.materialize(&root(None)).await.is_err());
    }
}
