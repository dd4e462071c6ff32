//! Integration tests for vanity import path discovery.
//!
//! Pages are served from an in-memory table keyed by URL (query stripped), so
//! these tests exercise prefix precedence, scheme fallback and conflict
//! detection without touching the network.

use async_trait::async_trait;
use rstest::rstest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use url::Url;
use xrepo_importpath::{
    Error, FetchResponse, Fetcher, RepositoryDescriptor, Resolver, ResolverOptions, VcsKind,
};

mod helpers {
    use super::*;

    /// Serves canned pages and records every requested URL.
    #[derive(Default)]
    pub struct PageFetcher {
        pages: HashMap<String, String>,
        pub requests: Mutex<Vec<String>>,
    }

    impl PageFetcher {
        pub fn new(pages: &[(&str, &str)]) -> Self {
            Self {
                pages: pages
                    .iter()
                    .map(|(url, body)| ((*url).to_string(), (*body).to_string()))
                    .collect(),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Fetcher for PageFetcher {
        async fn get(&self, url: &Url) -> Result<FetchResponse, String> {
            let mut key = url.clone();
            key.set_query(None);
            self.requests.lock().unwrap().push(url.to_string());
            Ok(match self.pages.get(key.as_str()) {
                Some(body) => FetchResponse {
                    status: 200,
                    body: body.clone(),
                },
                None => FetchResponse {
                    status: 404,
                    body: String::new(),
                },
            })
        }
    }

    pub fn vanity_pages() -> PageFetcher {
        PageFetcher::new(&[
            // Package at root of a GitHub repo.
            (
                "https://alice.org/pkg",
                r#"<head> <meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg"></head>"#,
            ),
            // Package in a sub-directory.
            (
                "https://alice.org/pkg/sub",
                r#"<head> <meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg"><body>"#,
            ),
            // Only reachable over plain http.
            (
                "http://alice.org/pkg/http",
                r#"<head> <meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
            ),
            // Tag below the root disagrees with the tag at the root.
            (
                "https://alice.org/pkg/mismatch",
                r#"<head> <meta name="go-import" content="alice.org/pkg hg https://github.com/alice/pkg">"#,
            ),
            // The same tag twice.
            (
                "http://alice.org/pkg/multiple",
                concat!(
                    "<head> ",
                    r#"<meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
                    r#"<meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
                ),
            ),
            // Two different tags for the same root.
            (
                "https://alice.org/pkg/conflict",
                concat!(
                    "<head> ",
                    r#"<meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
                    r#"<meta name="go-import" content="alice.org/pkg git https://gitlab.com/alice/pkg">"#,
                ),
            ),
            // Noise around the one real tag.
            (
                "https://alice.org/pkg/ignore",
                concat!(
                    r#"<meta name="go-junk" content="alice.org/pkg http://alice.org/pkg http://alice.org/pkg{/dir} http://alice.org/pkg{/dir}?f={file}#Line{line}">"#,
                    r#"<meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
                    r#"<meta name="go-import" content="alice.org/pkg https://github.com/alice/pkg">"#,
                    r#"<meta name="go-import" content="">"#,
                    r#"<meta name="go-import" content="alice.org/other git https://github.com/alice/other">"#,
                    r#"<meta name="go-import" content="alice.org/other git https://github.com/alice/other">"#,
                    "</head>",
                    r#"<meta name="go-import" content="alice.org/pkg git https://github.com/alice/pkg">"#,
                ),
            ),
            // A nested project with its own root below alice.org/pkg.
            (
                "https://alice.org/pkg/nested",
                r#"<head><meta name="go-import" content="alice.org/pkg/nested git https://github.com/alice/nested"></head>"#,
            ),
            (
                "https://alice.org/pkg/nested/deep",
                r#"<head><meta name="go-import" content="alice.org/pkg/nested git https://github.com/alice/nested"></head>"#,
            ),
            // Package at root of a plain Git host.
            (
                "https://bob.com/pkg",
                r#"<head> <meta name="go-import" content="bob.com/pkg git https://vcs.net/bob/pkg.git">"#,
            ),
            (
                "https://bob.com/pkg/sub",
                r#"<head> <meta name="go-import" content="bob.com/pkg git https://vcs.net/bob/pkg.git">"#,
            ),
        ])
    }

    pub fn resolver(fetcher: Arc<PageFetcher>) -> Resolver {
        Resolver::with_fetcher(ResolverOptions::default(), fetcher)
    }

    pub fn alice(import_path: &str, dir: &str) -> RepositoryDescriptor {
        let resolved = if dir.is_empty() {
            "github.com/alice/pkg".to_string()
        } else {
            format!("github.com/alice/pkg/{dir}")
        };
        RepositoryDescriptor {
            import_path: import_path.to_string(),
            project_root: "alice.org/pkg".to_string(),
            clone_url: "https://github.com/alice/pkg".to_string(),
            vcs: VcsKind::Git,
            resolved_host_path: resolved,
            repo_dir: dir.to_string(),
            revision: None,
        }
    }
}

use helpers::{alice, resolver, vanity_pages};

#[rstest]
#[case("alice.org/pkg", "")]
#[case("alice.org/pkg/sub", "sub")]
#[case("alice.org/pkg/http", "http")]
#[case("alice.org/pkg/ignore", "ignore")]
#[case("alice.org/pkg/multiple", "multiple")]
#[tokio::test]
async fn resolves_vanity_paths(#[case] import_path: &str, #[case] dir: &str) {
    let resolver = resolver(Arc::new(vanity_pages()));

    let descriptor = resolver
        .resolve(import_path, &CancellationToken::new())
        .await
        .unwrap_or_else(|e| panic!("resolve({import_path}) failed: {e}"));

    assert_eq!(descriptor, alice(import_path, dir));
}

#[rstest]
#[case("bob.com/pkg", "vcs.net/bob/pkg.git")]
#[case("bob.com/pkg/sub", "vcs.net/bob/pkg.git/sub")]
#[tokio::test]
async fn resolves_paths_hosted_on_plain_git_servers(
    #[case] import_path: &str,
    #[case] resolved: &str,
) {
    let resolver = resolver(Arc::new(vanity_pages()));

    let descriptor = resolver
        .resolve(import_path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(descriptor.project_root, "bob.com/pkg");
    assert_eq!(descriptor.clone_url, "https://vcs.net/bob/pkg.git");
    assert_eq!(descriptor.resolved_host_path, resolved);
    assert_eq!(descriptor.vcs, VcsKind::Git);
}

#[tokio::test]
async fn mismatch_between_prefix_levels_is_an_error() {
    let resolver = resolver(Arc::new(vanity_pages()));

    let err = resolver
        .resolve("alice.org/pkg/mismatch", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Mismatch { .. }), "got {err:?}");
}

#[tokio::test]
async fn distinct_tags_for_one_root_are_ambiguous() {
    let resolver = resolver(Arc::new(vanity_pages()));

    let err = resolver
        .resolve("alice.org/pkg/conflict", &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::Ambiguous { candidates, .. } => assert_eq!(candidates.len(), 2),
        other => panic!("expected Ambiguous, got {other:?}"),
    }
}

#[tokio::test]
async fn longest_prefix_tag_is_selected() {
    let resolver = resolver(Arc::new(vanity_pages()));

    let descriptor = resolver
        .resolve("alice.org/pkg/nested/deep", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(descriptor.project_root, "alice.org/pkg/nested");
    assert_eq!(descriptor.clone_url, "https://github.com/alice/nested");
    assert_eq!(
        descriptor.resolved_host_path,
        "github.com/alice/nested/deep"
    );
}

#[tokio::test]
async fn undiscoverable_path_falls_back_to_parent_prefix() {
    let fetcher = Arc::new(vanity_pages());
    let resolver = resolver(Arc::clone(&fetcher));

    let descriptor = resolver
        .resolve("alice.org/pkg/undocumented", &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        descriptor,
        alice("alice.org/pkg/undocumented", "undocumented")
    );
    let requests = fetcher.requests.lock().unwrap().clone();
    assert_eq!(
        &requests[..3],
        &[
            "https://alice.org/pkg/undocumented?go-get=1".to_string(),
            "http://alice.org/pkg/undocumented?go-get=1".to_string(),
            "https://alice.org/pkg?go-get=1".to_string(),
        ]
    );
}

#[tokio::test]
async fn bare_host_path_without_tag_is_not_found() {
    let fetcher = Arc::new(vanity_pages());
    let resolver = resolver(Arc::clone(&fetcher));

    let err = resolver
        .resolve("carol.net/lib", &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        Error::NotFound { attempts, .. } => {
            let urls: Vec<_> = attempts.iter().map(|a| a.url.as_str()).collect();
            assert_eq!(
                urls,
                vec![
                    "https://carol.net/lib?go-get=1",
                    "http://carol.net/lib?go-get=1",
                    "https://carol.net/?go-get=1",
                    "http://carol.net/?go-get=1",
                ]
            );
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn warm_cache_returns_identical_descriptor_without_fetching() {
    let fetcher = Arc::new(vanity_pages());
    let resolver = resolver(Arc::clone(&fetcher));
    let cancel = CancellationToken::new();

    let cold = resolver.resolve("alice.org/pkg/sub", &cancel).await.unwrap();
    let requests_after_cold = fetcher.request_count();
    let warm = resolver.resolve("alice.org/pkg/sub", &cancel).await.unwrap();

    assert_eq!(cold, warm);
    assert_eq!(fetcher.request_count(), requests_after_cold);
}

#[tokio::test]
async fn sub_paths_are_cached_separately() {
    let resolver = resolver(Arc::new(vanity_pages()));
    let cancel = CancellationToken::new();

    let root = resolver.resolve("alice.org/pkg", &cancel).await.unwrap();
    let sub = resolver.resolve("alice.org/pkg/sub", &cancel).await.unwrap();

    assert_eq!(root.project_root, sub.project_root);
    assert_ne!(root.resolved_host_path, sub.resolved_host_path);
    assert_eq!(resolver.cached(), 2);
}

#[tokio::test]
async fn http_is_not_consulted_when_https_document_was_served() {
    let fetcher = Arc::new(helpers::PageFetcher::new(&[
        ("https://carol.org/pkg", "<head><title>carol</title></head>"),
        (
            "http://carol.org/pkg",
            r#"<head><meta name="go-import" content="carol.org/pkg git https://evil.example/pkg"></head>"#,
        ),
    ]));
    let shared: Arc<helpers::PageFetcher> = Arc::clone(&fetcher);
    let resolver = Resolver::with_fetcher(
        ResolverOptions {
            max_prefix_attempts: 1,
            ..ResolverOptions::default()
        },
        shared,
    );

    let err = resolver
        .resolve("carol.org/pkg", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }), "got {err:?}");
    let requests = fetcher.requests.lock().unwrap().clone();
    assert_eq!(requests, vec!["https://carol.org/pkg?go-get=1".to_string()]);
}

#[tokio::test]
async fn root_verification_does_not_fall_back_to_http_after_https_answer() {
    let fetcher = Arc::new(helpers::PageFetcher::new(&[
        (
            "https://dave.org/pkg/sub",
            r#"<head><meta name="go-import" content="dave.org/pkg git https://github.com/dave/pkg"></head>"#,
        ),
        ("https://dave.org/pkg", "<head></head>"),
        (
            "http://dave.org/pkg",
            r#"<head><meta name="go-import" content="dave.org/pkg git https://github.com/dave/pkg"></head>"#,
        ),
    ]));
    let resolver = resolver(Arc::clone(&fetcher));

    let err = resolver
        .resolve("dave.org/pkg/sub", &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotFound { .. }), "got {err:?}");
    let requests = fetcher.requests.lock().unwrap().clone();
    assert!(!requests.contains(&"http://dave.org/pkg?go-get=1".to_string()));
}
