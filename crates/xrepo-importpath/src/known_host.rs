//! Hosting services whose import paths map directly onto repositories.

use regex::Regex;
use std::sync::LazyLock;

use crate::descriptor::{RepositoryDescriptor, VcsKind};
use crate::error::{Error, Result};

/// A recognised `host/owner/repo[/dir...]` layout.
struct HostPattern {
    host: &'static str,
    pattern: Regex,
    vcs: VcsKind,
}

static PATTERNS: LazyLock<Vec<HostPattern>> = LazyLock::new(|| {
    ["github.com", "gitlab.com", "bitbucket.org"]
        .into_iter()
        .map(|host| HostPattern {
            host,
            pattern: Regex::new(&format!(
                r"^{}/(?P<owner>[A-Za-z0-9_.\-]+)/(?P<repo>[A-Za-z0-9_.\-]+)(?P<dir>/[A-Za-z0-9_.\-/~+]*)?$",
                regex::escape(host)
            ))
            .expect("host pattern is a valid regex"),
            vcs: VcsKind::Git,
        })
        .collect()
});

/// Synthesize a descriptor for an import path on a recognised host.
///
/// Returns `Ok(None)` when the first path element is not a recognised host.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] when the host is recognised but the path
/// does not name an `owner/repo` pair.
pub fn match_known_host(import_path: &str) -> Result<Option<RepositoryDescriptor>> {
    let host = import_path.split('/').next().unwrap_or_default();
    let Some(entry) = PATTERNS.iter().find(|p| p.host == host) else {
        return Ok(None);
    };

    let captures = entry.pattern.captures(import_path).ok_or_else(|| {
        Error::invalid(
            import_path,
            format!("{host} import paths have the form {host}/owner/repo[/dir]"),
        )
    })?;

    let project_root = format!("{host}/{}/{}", &captures["owner"], &captures["repo"]);
    let repo_dir = captures
        .name("dir")
        .map(|m| m.as_str().trim_matches('/').to_string())
        .unwrap_or_default();

    Ok(Some(RepositoryDescriptor {
        import_path: import_path.to_string(),
        clone_url: format!("https://{project_root}"),
        project_root,
        vcs: entry.vcs.clone(),
        resolved_host_path: import_path.to_string(),
        repo_dir,
        revision: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn github_repo_root() {
        let descriptor = match_known_host("github.com/gorilla/mux").unwrap().unwrap();
        assert_eq!(descriptor.project_root, "github.com/gorilla/mux");
        assert_eq!(descriptor.clone_url, "https://github.com/gorilla/mux");
        assert_eq!(descriptor.resolved_host_path, "github.com/gorilla/mux");
        assert_eq!(descriptor.repo_dir, "");
        assert_eq!(descriptor.vcs, VcsKind::Git);
    }

    #[test]
    fn github_subdirectory() {
        let descriptor = match_known_host("github.com/docker/machine/libmachine/drivers")
            .unwrap()
            .unwrap();
        assert_eq!(descriptor.project_root, "github.com/docker/machine");
        assert_eq!(descriptor.repo_dir, "libmachine/drivers");
        assert_eq!(
            descriptor.resolved_host_path,
            "github.com/docker/machine/libmachine/drivers"
        );
    }

    #[rstest]
    #[case("gitlab.com/group/project/sub", "gitlab.com/group/project")]
    #[case("bitbucket.org/team/repo", "bitbucket.org/team/repo")]
    fn other_known_hosts(#[case] path: &str, #[case] root: &str) {
        let descriptor = match_known_host(path).unwrap().unwrap();
        assert_eq!(descriptor.project_root, root);
        assert_eq!(descriptor.clone_url, format!("https://{root}"));
    }

    #[test]
    fn two_segment_known_host_is_invalid() {
        assert!(matches!(
            match_known_host("github.com/gorilla"),
            Err(Error::InvalidInput { .. })
        ));
    }

    #[test]
    fn unknown_host_is_not_matched() {
        assert!(match_known_host("alice.org/pkg").unwrap().is_none());
        assert!(match_known_host("github.company.com/a/b").unwrap().is_none());
    }
}
